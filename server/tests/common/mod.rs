#![allow(dead_code)]

use std::sync::Arc;

use fixtures::FakeNetwork;
use statusphere::did::{HttpIdentityResolver, IdentityConfig};
use statusphere::oauth::{
    ClientKeys, LoginRedirect, MemorySessionStore, OAuthClient, OAuthClientConfig, SessionStore,
};

pub const CLIENT_HOST: &str = "http://statusphere.test";

pub struct TestApp {
    pub network: FakeNetwork,
    pub store: Arc<MemorySessionStore>,
    pub oauth: OAuthClient,
}

pub struct Callback {
    pub code: String,
    pub state: String,
    pub iss: String,
}

pub async fn setup() -> TestApp {
    setup_with_store(|store| store as Arc<dyn SessionStore>).await
}

/// Like [`setup`], with the client talking to `wrap(store)` while the test
/// keeps a handle on the underlying memory store.
pub async fn setup_with_store(
    wrap: impl FnOnce(Arc<MemorySessionStore>) -> Arc<dyn SessionStore>,
) -> TestApp {
    let network = FakeNetwork::spawn().await.unwrap();
    let http = reqwest::Client::new();

    let identity = HttpIdentityResolver::new(
        http.clone(),
        IdentityConfig {
            handle_resolver_url: network.handle_resolver_url(),
            plc_directory_url: network.plc_directory_url(),
        },
    );
    let store = Arc::new(MemorySessionStore::new());
    let config = OAuthClientConfig::for_host(
        CLIENT_HOST,
        "Statusphere Tests",
        ClientKeys::generate().unwrap(),
    );
    let oauth = OAuthClient::new(config, http, Arc::new(identity), wrap(store.clone()));

    TestApp {
        network,
        store,
        oauth,
    }
}

/// Play the browser: visit the authorization URL and read the callback
/// parameters off the redirect.
pub async fn authorize(redirect: &LoginRedirect) -> Callback {
    let browser = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let response = browser
        .get(&redirect.authorization_url)
        .send()
        .await
        .unwrap();
    assert!(
        response.status().is_redirection(),
        "authorize returned {}",
        response.status()
    );

    let location = response.headers()["location"].to_str().unwrap();
    let url = url::Url::parse(location).unwrap();
    assert!(location.starts_with(&format!("{CLIENT_HOST}/oauth-callback")));

    let param = |name: &str| {
        url.query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
            .unwrap_or_else(|| panic!("callback is missing {name}"))
    };

    Callback {
        code: param("code"),
        state: param("state"),
        iss: param("iss"),
    }
}

impl TestApp {
    pub async fn login(&self, handle: &str) -> String {
        let redirect = self.oauth.start_login(handle).await.unwrap();
        let callback = authorize(&redirect).await;
        self.oauth
            .complete_login(&callback.state, &callback.iss, &callback.code)
            .await
            .unwrap()
    }
}
