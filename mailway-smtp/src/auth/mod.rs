//! SASL authentication for SMTP sessions: the server-side challenge loop
//! and the mechanism set advertised to clients.
//!
//! Operators supply an [`Authenticator`] to verify credentials; the
//! session machinery here owns the wire exchange.

mod mechanisms;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use mechanisms::{DEFAULT_SERVER_MECHANISMS, Mechanism};
pub(crate) use mechanisms::{
    b64_decode, b64_encode, cram_md5_digest, cram_md5_response, parse_cram_md5, parse_plain,
    plain_response, xoauth2_response,
};

use crate::{
    error::SmtpError,
    io::SmtpIo,
    reply::{Reply, invalid_credentials},
};

/// Verifies credentials for server-side authentication.
///
/// `verify_secret` is used by mechanisms where the client presents the
/// secret directly (PLAIN, LOGIN). `get_secret` is used by mechanisms
/// that only exchange a digest (CRAM-MD5) and therefore need the stored
/// plaintext secret.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Check the secret for the given identities, returning a
    /// representation of the identity that authenticated.
    async fn verify_secret(
        &self,
        authcid: &str,
        secret: &str,
        authzid: Option<&str>,
    ) -> Result<String, AuthError>;

    /// Fetch the plaintext secret for the given identity, returning the
    /// secret and the identity that would be authenticated. The default
    /// refuses, which disables digest mechanisms.
    async fn get_secret(&self, authcid: &str) -> Result<(String, String), AuthError> {
        let _ = authcid;
        Err(AuthError::invalid_credentials())
    }
}

/// An authentication failure carrying the reply the server should send.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct AuthError {
    message: String,
    pub reply: Reply,
}

impl AuthError {
    pub fn invalid_mechanism() -> Self {
        let message = "Invalid authentication mechanism".to_owned();
        Self {
            reply: Reply::new("504", &format!("5.5.4 {message}")),
            message,
        }
    }

    pub fn canceled() -> Self {
        let message = "Authentication canceled by client".to_owned();
        Self {
            reply: Reply::new("501", &format!("5.7.0 {message}")),
            message,
        }
    }

    pub fn invalid_string(mechanism: Mechanism) -> Self {
        let message = format!("Invalid {mechanism} authentication string");
        Self {
            reply: Reply::new("501", &format!("5.5.2 {message}")),
            message,
        }
    }

    pub fn invalid_credentials() -> Self {
        Self {
            message: "Authentication credentials invalid".to_owned(),
            reply: invalid_credentials(),
        }
    }
}

/// Failure modes of a full authentication attempt: either the mechanism
/// rejected the client (send `.reply` and carry on) or the session itself
/// broke.
#[derive(Debug, Error)]
pub enum AuthAttemptError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Session(#[from] SmtpError),
}

/// Server-side SASL session state: which mechanisms are enabled and the
/// hostname used in digest challenges.
#[derive(Debug, Clone)]
pub struct AuthSession {
    mechanisms: Vec<Mechanism>,
    hostname: String,
}

impl Default for AuthSession {
    fn default() -> Self {
        Self::new(DEFAULT_SERVER_MECHANISMS.to_vec())
    }
}

impl AuthSession {
    pub fn new(mechanisms: Vec<Mechanism>) -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self {
            mechanisms: mechanisms
                .into_iter()
                .filter(|m| m.server_capable())
                .collect(),
            hostname,
        }
    }

    /// Mechanisms available on the session. Unencrypted transports hide
    /// mechanisms that are not safe on cleartext.
    pub fn available(&self, encrypted: bool) -> Vec<Mechanism> {
        self.mechanisms
            .iter()
            .copied()
            .filter(|m| encrypted || m.secure())
            .collect()
    }

    /// The `AUTH` extension parameter: the available mechanism names
    /// separated by spaces.
    pub fn advertisement(&self, encrypted: bool) -> String {
        self.available(encrypted)
            .iter()
            .map(|m| m.name())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Drive one server-side authentication attempt from the `AUTH`
    /// argument `<MECH> [initial-response]`. Returns the authenticated
    /// identity.
    pub async fn server_attempt<S>(
        &self,
        io: &mut SmtpIo<S>,
        arg: &str,
        backend: &dyn Authenticator,
        encrypted: bool,
    ) -> Result<String, AuthAttemptError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (name, initial_response) = parse_auth_arg(arg)?;
        let mechanism = Mechanism::from_name(&name)
            .filter(|m| self.available(encrypted).contains(m))
            .ok_or_else(AuthError::invalid_mechanism)?;

        if initial_response.as_deref() == Some("*") {
            return Err(AuthError::canceled().into());
        }

        match mechanism {
            Mechanism::Plain => {
                self.attempt_plain(io, initial_response, backend).await
            }
            Mechanism::Login => {
                self.attempt_login(io, initial_response, backend).await
            }
            Mechanism::CramMd5 => self.attempt_cram_md5(io, backend).await,
            Mechanism::XOauth2 => Err(AuthError::invalid_mechanism().into()),
        }
    }

    /// Send a `334` challenge and read the client's response line. A
    /// response of `*` cancels the exchange.
    async fn challenge<S>(
        &self,
        io: &mut SmtpIo<S>,
        challenge: &str,
    ) -> Result<String, AuthAttemptError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        Reply::new("334", challenge).send(io, true).await?;
        let response = io.recv_line().await?;
        if response.trim() == "*" {
            return Err(AuthError::canceled().into());
        }
        Ok(response)
    }

    async fn attempt_plain<S>(
        &self,
        io: &mut SmtpIo<S>,
        initial_response: Option<String>,
        backend: &dyn Authenticator,
    ) -> Result<String, AuthAttemptError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let response = match initial_response {
            Some(response) => response,
            None => self.challenge(io, "").await?,
        };

        let decoded = b64_decode(&response)
            .ok_or_else(|| AuthError::invalid_string(Mechanism::Plain))?;
        let (authzid, authcid, secret) =
            parse_plain(&decoded).ok_or_else(|| AuthError::invalid_string(Mechanism::Plain))?;

        let authzid = (!authzid.is_empty()).then_some(authzid);
        Ok(backend
            .verify_secret(&authcid, &secret, authzid.as_deref())
            .await?)
    }

    async fn attempt_login<S>(
        &self,
        io: &mut SmtpIo<S>,
        initial_response: Option<String>,
        backend: &dyn Authenticator,
    ) -> Result<String, AuthAttemptError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        // base64("Username:") and base64("Password:")
        let username = match initial_response {
            Some(response) => response,
            None => self.challenge(io, "VXNlcm5hbWU6").await?,
        };
        let username = b64_decode(&username)
            .and_then(|b| String::from_utf8(b).ok())
            .ok_or_else(|| AuthError::invalid_string(Mechanism::Login))?;

        let password = self.challenge(io, "UGFzc3dvcmQ6").await?;
        let password = b64_decode(&password)
            .and_then(|b| String::from_utf8(b).ok())
            .ok_or_else(|| AuthError::invalid_string(Mechanism::Login))?;

        Ok(backend.verify_secret(&username, &password, None).await?)
    }

    async fn attempt_cram_md5<S>(
        &self,
        io: &mut SmtpIo<S>,
        backend: &dyn Authenticator,
    ) -> Result<String, AuthAttemptError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let challenge = self.build_cram_challenge();
        let encoded = mechanisms::b64_encode(challenge.as_bytes());
        let response = self.challenge(io, &encoded).await?;

        let decoded = b64_decode(&response)
            .ok_or_else(|| AuthError::invalid_string(Mechanism::CramMd5))?;
        let (authcid, digest) = parse_cram_md5(&decoded)
            .ok_or_else(|| AuthError::invalid_string(Mechanism::CramMd5))?;

        let (secret, identity) = backend.get_secret(&authcid).await?;
        let expected = cram_md5_digest(secret.as_bytes(), challenge.as_bytes());
        if expected != digest {
            return Err(AuthError::invalid_credentials().into());
        }
        Ok(identity)
    }

    fn build_cram_challenge(&self) -> String {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        format!(
            "<{:032x}.{}@{}>",
            u128::from(ulid::Ulid::new()),
            timestamp,
            self.hostname
        )
    }
}

/// Split the AUTH argument into `(MECH, initial-response)`.
fn parse_auth_arg(arg: &str) -> Result<(String, Option<String>), AuthError> {
    let arg = arg.trim();
    let (name, rest) = match arg.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, Some(rest.trim().to_owned())),
        None => (arg, None),
    };

    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(AuthError::invalid_mechanism());
    }
    Ok((name.to_owned(), rest))
}

#[cfg(test)]
mod test {
    use super::*;

    struct StaticAuth;

    #[async_trait]
    impl Authenticator for StaticAuth {
        async fn verify_secret(
            &self,
            authcid: &str,
            secret: &str,
            _authzid: Option<&str>,
        ) -> Result<String, AuthError> {
            if authcid == "user" && secret == "pass" {
                Ok(authcid.to_owned())
            } else {
                Err(AuthError::invalid_credentials())
            }
        }

        async fn get_secret(&self, authcid: &str) -> Result<(String, String), AuthError> {
            Ok(("pass".to_owned(), authcid.to_owned()))
        }
    }

    fn session() -> AuthSession {
        AuthSession::default()
    }

    #[test]
    fn cleartext_hides_insecure_mechanisms() {
        let session = session();
        assert_eq!(session.available(false), vec![Mechanism::CramMd5]);
        assert_eq!(session.advertisement(false), "CRAM-MD5");
        assert_eq!(session.advertisement(true), "PLAIN LOGIN CRAM-MD5");
    }

    #[tokio::test]
    async fn plain_with_initial_response() {
        let (client, _server) = tokio::io::duplex(4096);
        let mut io = SmtpIo::new(client);

        let response = plain_response(None, "user", "pass");
        let identity = session()
            .server_attempt(&mut io, &format!("PLAIN {response}"), &StaticAuth, true)
            .await
            .unwrap();
        assert_eq!(identity, "user");
    }

    #[tokio::test]
    async fn plain_bad_base64_is_rejected() {
        let (client, _server) = tokio::io::duplex(4096);
        let mut io = SmtpIo::new(client);

        let err = session()
            .server_attempt(&mut io, "PLAIN !!!not-base64!!!", &StaticAuth, true)
            .await
            .unwrap_err();
        match err {
            AuthAttemptError::Auth(e) => assert_eq!(e.reply.code(), Some("501")),
            AuthAttemptError::Session(e) => panic!("unexpected session error: {e}"),
        }
    }

    #[tokio::test]
    async fn cancellation_in_initial_response() {
        let (client, _server) = tokio::io::duplex(4096);
        let mut io = SmtpIo::new(client);

        let err = session()
            .server_attempt(&mut io, "PLAIN *", &StaticAuth, true)
            .await
            .unwrap_err();
        match err {
            AuthAttemptError::Auth(e) => {
                assert_eq!(e.reply.code(), Some("501"));
                assert_eq!(
                    e.reply.message().as_deref(),
                    Some("5.7.0 Authentication canceled by client")
                );
            }
            AuthAttemptError::Session(e) => panic!("unexpected session error: {e}"),
        }
    }

    #[tokio::test]
    async fn unknown_mechanism_is_rejected() {
        let (client, _server) = tokio::io::duplex(4096);
        let mut io = SmtpIo::new(client);

        let err = session()
            .server_attempt(&mut io, "SCRAM-SHA-1", &StaticAuth, true)
            .await
            .unwrap_err();
        match err {
            AuthAttemptError::Auth(e) => assert_eq!(e.reply.code(), Some("504")),
            AuthAttemptError::Session(e) => panic!("unexpected session error: {e}"),
        }
    }

    #[tokio::test]
    async fn insecure_mechanism_hidden_on_cleartext() {
        let (client, _server) = tokio::io::duplex(4096);
        let mut io = SmtpIo::new(client);

        let err = session()
            .server_attempt(&mut io, "PLAIN", &StaticAuth, false)
            .await
            .unwrap_err();
        match err {
            AuthAttemptError::Auth(e) => assert_eq!(e.reply.code(), Some("504")),
            AuthAttemptError::Session(e) => panic!("unexpected session error: {e}"),
        }
    }

    #[tokio::test]
    async fn login_challenge_flow() {
        let (client, server) = tokio::io::duplex(4096);
        let mut io = SmtpIo::new(client);

        let peer = tokio::spawn(async move {
            let mut peer_io = SmtpIo::new(server);
            // Username: challenge
            let (code, msg) = peer_io.recv_reply().await.unwrap();
            assert_eq!((code.as_str(), msg.as_str()), ("334", "VXNlcm5hbWU6"));
            peer_io.send_command(&mechanisms::b64_encode(b"user"));
            peer_io.flush_send().await.unwrap();
            // Password: challenge
            let (code, msg) = peer_io.recv_reply().await.unwrap();
            assert_eq!((code.as_str(), msg.as_str()), ("334", "UGFzc3dvcmQ6"));
            peer_io.send_command(&mechanisms::b64_encode(b"pass"));
            peer_io.flush_send().await.unwrap();
        });

        let identity = session()
            .server_attempt(&mut io, "LOGIN", &StaticAuth, true)
            .await
            .unwrap();
        assert_eq!(identity, "user");
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn cram_md5_challenge_flow() {
        let (client, server) = tokio::io::duplex(4096);
        let mut io = SmtpIo::new(client);

        let peer = tokio::spawn(async move {
            let mut peer_io = SmtpIo::new(server);
            let (code, msg) = peer_io.recv_reply().await.unwrap();
            assert_eq!(code, "334");
            let challenge = b64_decode(&msg).unwrap();
            peer_io.send_command(&cram_md5_response("user", "pass", &challenge));
            peer_io.flush_send().await.unwrap();
        });

        let identity = session()
            .server_attempt(&mut io, "CRAM-MD5", &StaticAuth, false)
            .await
            .unwrap();
        assert_eq!(identity, "user");
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn cram_md5_wrong_digest_is_535() {
        let (client, server) = tokio::io::duplex(4096);
        let mut io = SmtpIo::new(client);

        let peer = tokio::spawn(async move {
            let mut peer_io = SmtpIo::new(server);
            let (code, msg) = peer_io.recv_reply().await.unwrap();
            assert_eq!(code, "334");
            let challenge = b64_decode(&msg).unwrap();
            peer_io.send_command(&cram_md5_response("user", "wrong", &challenge));
            peer_io.flush_send().await.unwrap();
        });

        let err = session()
            .server_attempt(&mut io, "CRAM-MD5", &StaticAuth, false)
            .await
            .unwrap_err();
        match err {
            AuthAttemptError::Auth(e) => assert_eq!(e.reply.code(), Some("535")),
            AuthAttemptError::Session(e) => panic!("unexpected session error: {e}"),
        }
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn challenge_cancellation() {
        let (client, server) = tokio::io::duplex(4096);
        let mut io = SmtpIo::new(client);

        let peer = tokio::spawn(async move {
            let mut peer_io = SmtpIo::new(server);
            let (code, _) = peer_io.recv_reply().await.unwrap();
            assert_eq!(code, "334");
            peer_io.send_command("*");
            peer_io.flush_send().await.unwrap();
        });

        let err = session()
            .server_attempt(&mut io, "CRAM-MD5", &StaticAuth, false)
            .await
            .unwrap_err();
        match err {
            AuthAttemptError::Auth(e) => assert_eq!(e.reply.code(), Some("501")),
            AuthAttemptError::Session(e) => panic!("unexpected session error: {e}"),
        }
        peer.await.unwrap();
    }
}
