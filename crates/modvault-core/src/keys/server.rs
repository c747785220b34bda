//! HKP key server client.

use reqwest::{Client, StatusCode};

use super::KeyError;
use crate::openpgp::{KeyId, PublicKeyRing, read_keyrings};

/// Looks keys up on a list of HKP servers, in order.
#[derive(Debug, Clone)]
pub struct KeyServerClient {
    client: Client,
    servers: Vec<String>,
}

impl KeyServerClient {
    /// Query `servers` through `client`.
    pub fn new(client: Client, servers: Vec<String>) -> Self {
        Self { client, servers }
    }

    /// Server URIs, in query order.
    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Fetch the key ring holding `id`.
    ///
    /// A server answering 404, an error status or a body without the key is
    /// skipped. Returns `Ok(None)` when at least one server answered and none
    /// had the key.
    ///
    /// # Errors
    ///
    /// Returns the last transport error when no server could be reached.
    pub async fn lookup(&self, id: &KeyId) -> Result<Option<PublicKeyRing>, KeyError> {
        let mut last_error = None;
        let mut answered = false;
        for server in &self.servers {
            let url = format!("{}/pks/lookup", server.trim_end_matches('/'));
            let search = format!("0x{id}");
            let resp = match self
                .client
                .get(&url)
                .query(&[("op", "get"), ("options", "mr"), ("search", search.as_str())])
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::debug!("Key server {server} unreachable: {e}");
                    last_error = Some(KeyError::Http(e));
                    continue;
                }
            };
            answered = true;
            if resp.status() == StatusCode::NOT_FOUND {
                tracing::debug!("Key {id} not found on {server}");
                continue;
            }
            if !resp.status().is_success() {
                tracing::debug!("Key server {server} answered {} for {id}", resp.status());
                continue;
            }
            let body = match resp.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    last_error = Some(KeyError::Http(e));
                    continue;
                }
            };
            match read_keyrings(&body) {
                Ok(rings) => {
                    if let Some(ring) = rings.into_iter().find(|r| r.find_key(id).is_some()) {
                        tracing::info!("Downloaded key {id} from {server}");
                        return Ok(Some(ring));
                    }
                }
                Err(e) => tracing::warn!("Key server {server} returned an unreadable key for {id}: {e}"),
            }
        }
        match last_error {
            Some(e) if !answered => Err(e),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openpgp::armor::{self, ArmorKind};
    use crate::openpgp::testkit;
    use mockito::{Matcher, Server};

    #[tokio::test]
    async fn downloads_armored_key() {
        let key = testkit::key(21, "Server Key");
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/pks/lookup")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("op".into(), "get".into()),
                Matcher::UrlEncoded("search".into(), format!("0x{}", key.fingerprint())),
            ]))
            .with_status(200)
            .with_body(armor::encode(ArmorKind::PublicKey, key.ring.encoded()))
            .create_async()
            .await;

        let client = KeyServerClient::new(Client::new(), vec![server.url()]);
        let id = KeyId::parse(&key.fingerprint()).unwrap();
        let ring = client.lookup(&id).await.unwrap().unwrap();
        assert_eq!(ring, key.ring);
    }

    #[tokio::test]
    async fn not_found_falls_through_to_next_server() {
        let key = testkit::key(22, "Second Server");
        let mut first = Server::new_async().await;
        let mut second = Server::new_async().await;
        let _a = first
            .mock("GET", "/pks/lookup")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;
        let _b = second
            .mock("GET", "/pks/lookup")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(key.ring.encoded().to_vec())
            .create_async()
            .await;

        let client = KeyServerClient::new(Client::new(), vec![first.url(), second.url()]);
        let ring = client
            .lookup(&KeyId::Long(key.ring.key_id()))
            .await
            .unwrap();
        assert_eq!(ring, Some(key.ring.clone()));
    }

    #[tokio::test]
    async fn missing_everywhere_is_none() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/pks/lookup")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;
        let client = KeyServerClient::new(Client::new(), vec![server.url()]);
        assert_eq!(client.lookup(&KeyId::Long(0xDEAD_BEEF)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unreachable_servers_are_an_error() {
        let client = KeyServerClient::new(Client::new(), vec!["http://127.0.0.1:1".into()]);
        assert!(matches!(
            client.lookup(&KeyId::Long(1)).await,
            Err(KeyError::Http(_))
        ));
    }
}
