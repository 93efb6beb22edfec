pub mod components;
pub mod cookies;
pub mod did;
pub mod encryption;
pub mod errors;
pub mod oauth;
pub mod routes;
pub mod setup;
pub mod state;
pub mod status;
