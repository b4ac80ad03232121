use log::debug;
use russh::client::Handler;
use russh::keys::PublicKey;

/// Client side of the test connections. Only trusts the jump server's host key.
#[derive(Clone)]
pub struct ClientHandler {
    pub host_key: PublicKey,
}

impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!("server offered host key {:?}", server_public_key.algorithm());
        Ok(server_public_key.key_data() == self.host_key.key_data())
    }
}
