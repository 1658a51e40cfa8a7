//! Built-in SASL mechanisms and their wire primitives.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use md5::Md5;

type HmacMd5 = Hmac<Md5>;

/// The SASL mechanisms the engine knows how to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    /// RFC 4616. Not safe on unencrypted channels.
    Plain,
    /// Base64 username/password exchange. Not safe on unencrypted
    /// channels.
    Login,
    /// RFC 2195. The secret never crosses the wire, so it is offered on
    /// cleartext sessions, but the server needs the plaintext secret.
    CramMd5,
    /// OAuth 2.0 bearer-token mechanism as defined by Google.
    /// Client-side only.
    XOauth2,
}

/// Mechanisms a server advertises by default.
pub const DEFAULT_SERVER_MECHANISMS: &[Mechanism] =
    &[Mechanism::Plain, Mechanism::Login, Mechanism::CramMd5];

impl Mechanism {
    pub fn name(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::CramMd5 => "CRAM-MD5",
            Self::XOauth2 => "XOAUTH2",
        }
    }

    /// Whether the mechanism is safe to offer on an unencrypted channel.
    pub fn secure(self) -> bool {
        matches!(self, Self::CramMd5)
    }

    /// Whether the server half of the mechanism is implemented.
    pub fn server_capable(self) -> bool {
        !matches!(self, Self::XOauth2)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            "CRAM-MD5" => Some(Self::CramMd5),
            "XOAUTH2" => Some(Self::XOauth2),
            _ => None,
        }
    }
}

impl std::fmt::Display for Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) fn b64_encode(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub(crate) fn b64_decode(data: &str) -> Option<Vec<u8>> {
    BASE64.decode(data.trim()).ok()
}

/// The PLAIN initial response: `authzid NUL authcid NUL secret`,
/// base64-encoded for the wire.
pub(crate) fn plain_response(authzid: Option<&str>, authcid: &str, secret: &str) -> String {
    b64_encode(format!("{}\0{authcid}\0{secret}", authzid.unwrap_or_default()).as_bytes())
}

/// Split a decoded PLAIN response into `(authzid, authcid, secret)`.
/// The authorization identity may be empty; the authentication identity
/// may not.
pub(crate) fn parse_plain(decoded: &[u8]) -> Option<(String, String, String)> {
    let mut parts = decoded.split(|&b| b == 0);
    let authzid = parts.next()?;
    let authcid = parts.next()?;
    let secret = parts.next()?;
    if parts.next().is_some() || authcid.is_empty() {
        return None;
    }
    Some((
        String::from_utf8(authzid.to_vec()).ok()?,
        String::from_utf8(authcid.to_vec()).ok()?,
        String::from_utf8(secret.to_vec()).ok()?,
    ))
}

/// Hex HMAC-MD5 digest of the challenge keyed with the shared secret.
pub(crate) fn cram_md5_digest(secret: &[u8], challenge: &[u8]) -> String {
    let mut mac = HmacMd5::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(challenge);
    hex::encode(mac.finalize().into_bytes())
}

/// The CRAM-MD5 response line: `authcid<sp>hexdigest`, base64-encoded.
pub(crate) fn cram_md5_response(authcid: &str, secret: &str, challenge: &[u8]) -> String {
    let digest = cram_md5_digest(secret.as_bytes(), challenge);
    b64_encode(format!("{authcid} {digest}").as_bytes())
}

/// Split a decoded CRAM-MD5 response into `(authcid, hexdigest)` on the
/// final space.
pub(crate) fn parse_cram_md5(decoded: &[u8]) -> Option<(String, String)> {
    let text = std::str::from_utf8(decoded).ok()?;
    let (authcid, digest) = text.rsplit_once(' ')?;
    if authcid.is_empty() || digest.is_empty() {
        return None;
    }
    Some((authcid.to_owned(), digest.to_owned()))
}

/// The XOAUTH2 initial response:
/// `user=<authcid>^Aauth=Bearer <token>^A^A`, base64-encoded.
pub(crate) fn xoauth2_response(authcid: &str, token: &str) -> String {
    b64_encode(format!("user={authcid}\x01auth=Bearer {token}\x01\x01").as_bytes())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mechanism_names_round_trip() {
        for mech in [
            Mechanism::Plain,
            Mechanism::Login,
            Mechanism::CramMd5,
            Mechanism::XOauth2,
        ] {
            assert_eq!(Mechanism::from_name(mech.name()), Some(mech));
        }
        assert_eq!(Mechanism::from_name("cram-md5"), Some(Mechanism::CramMd5));
        assert_eq!(Mechanism::from_name("SCRAM-SHA-1"), None);
    }

    #[test]
    fn cleartext_security() {
        assert!(Mechanism::CramMd5.secure());
        assert!(!Mechanism::Plain.secure());
        assert!(!Mechanism::Login.secure());
    }

    #[test]
    fn plain_round_trip() {
        let encoded = plain_response(Some("zid"), "user", "pass");
        let decoded = b64_decode(&encoded).unwrap();
        assert_eq!(
            parse_plain(&decoded),
            Some(("zid".into(), "user".into(), "pass".into()))
        );
    }

    #[test]
    fn plain_requires_authcid() {
        assert!(parse_plain(b"\0\0secret").is_none());
        assert!(parse_plain(b"no separators").is_none());
        assert!(parse_plain(b"a\0b\0c\0d").is_none());
    }

    #[test]
    fn cram_md5_known_vector() {
        // RFC 2195 section 2 example.
        let digest = cram_md5_digest(
            b"tanstaaftanstaaf",
            b"<1896.697170952@postoffice.reston.mci.net>",
        );
        assert_eq!(digest, "b913a602c7eda7a495b4e6e7334d3890");
    }

    #[test]
    fn cram_md5_response_parses() {
        let challenge = b"<abc.123@host>";
        let encoded = cram_md5_response("tim", "secret", challenge);
        let decoded = b64_decode(&encoded).unwrap();
        let (authcid, digest) = parse_cram_md5(&decoded).unwrap();
        assert_eq!(authcid, "tim");
        assert_eq!(digest, cram_md5_digest(b"secret", challenge));
    }

    #[test]
    fn xoauth2_layout() {
        let encoded = xoauth2_response("user@example.com", "token123");
        let decoded = b64_decode(&encoded).unwrap();
        assert_eq!(
            decoded,
            b"user=user@example.com\x01auth=Bearer token123\x01\x01"
        );
    }
}
