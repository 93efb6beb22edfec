use age::{secrecy::ExposeSecret as _, x25519::Identity};
use color_eyre::eyre::Result;
use statusphere::oauth::ClientKeys;

fn main() -> Result<()> {
    color_eyre::install()?;

    let client_keys = ClientKeys::generate()?;
    println!("Generated OAuth client key (kid {}):", client_keys.kid());
    println!("OAUTH_PRIVATE_KEY=\"{}\"", client_keys.to_base64_pem());
    println!();

    let identity = Identity::generate();
    let key_string = identity.to_string();
    println!("Generated age encryption key:");
    println!("ENCRYPTION_KEY=\"{}\"", key_string.expose_secret());
    println!();

    println!("Add these to your .env file.");

    Ok(())
}
