use crate::probe::{PhaseError, ProbeErrorKind, tls_version_label};
use openssl::nid::Nid;
use openssl::ssl::{HandshakeError, SslConnector, SslMethod};
use openssl::x509::{X509, X509NameRef, X509VerifyResult};
use std::net::TcpStream;
use std::time::Duration;

// Wire format: length-prefixed protocol names.
const ALPN_PROTOCOLS: &[u8] = b"\x02h2\x08http/1.1";

/// What the standalone handshake learned about the server.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(super) struct TlsSummary {
    pub version: String,
    pub cipher: String,
    pub alpn: String,
    pub cert_subject: String,
    pub cert_issuer: String,
}

/// Runs a TLS client handshake over an already connected socket, offering
/// h2 and http/1.1 and verifying the certificate against `server_name`.
pub(super) fn handshake(
    stream: TcpStream,
    server_name: &str,
    timeout: Duration,
) -> Result<TlsSummary, PhaseError> {
    let tls_error = |err: openssl::error::ErrorStack| PhaseError::new(ProbeErrorKind::Tls, err.to_string());
    let mut builder = SslConnector::builder(SslMethod::tls_client()).map_err(tls_error)?;
    builder.set_alpn_protos(ALPN_PROTOCOLS).map_err(tls_error)?;
    let connector = builder.build();

    stream
        .set_read_timeout(Some(timeout))
        .and_then(|_| stream.set_write_timeout(Some(timeout)))
        .map_err(|err| PhaseError::from_io(&err))?;

    let tls = match connector.connect(server_name, stream) {
        Ok(tls) => tls,
        Err(HandshakeError::WouldBlock(_)) => {
            return Err(PhaseError::new(
                ProbeErrorKind::Timeout,
                "tls: handshake timeout",
            ));
        }
        Err(HandshakeError::SetupFailure(stack)) => return Err(tls_error(stack)),
        Err(HandshakeError::Failure(mid)) => {
            let verify = mid.ssl().verify_result();
            let message = if verify != X509VerifyResult::OK {
                format!("tls: failed to verify certificate: {}", verify.error_string())
            } else {
                format!("tls: {}", mid.error())
            };
            return Err(PhaseError::new(ProbeErrorKind::Tls, message));
        }
    };

    let ssl = tls.ssl();
    let mut summary = TlsSummary {
        version: tls_version_label(ssl.version_str()),
        ..TlsSummary::default()
    };
    if let Some(cipher) = ssl.current_cipher() {
        summary.cipher = cipher.standard_name().unwrap_or(cipher.name()).to_string();
    }
    if let Some(alpn) = ssl.selected_alpn_protocol() {
        summary.alpn = String::from_utf8_lossy(alpn).into_owned();
    }
    if let Some(cert) = ssl.peer_certificate() {
        summary.cert_subject = certificate_subject(&cert);
        summary.cert_issuer = certificate_issuer(cert.issuer_name());
    }
    Ok(summary)
}

/// Common name plus the first DNS SAN, comma-joined.
fn certificate_subject(cert: &X509) -> String {
    let mut parts = Vec::with_capacity(2);
    if let Some(cn) = name_entry(cert.subject_name(), Nid::COMMONNAME) {
        parts.push(cn);
    }
    let first_san = cert
        .subject_alt_names()
        .and_then(|names| names.iter().find_map(|name| name.dnsname().map(str::to_string)));
    if let Some(san) = first_san {
        parts.push(san);
    }
    parts.join(",")
}

fn certificate_issuer(issuer: &X509NameRef) -> String {
    name_entry(issuer, Nid::COMMONNAME)
        .or_else(|| name_entry(issuer, Nid::ORGANIZATIONNAME))
        .unwrap_or_default()
}

fn name_entry(name: &X509NameRef, nid: Nid) -> Option<String> {
    name.entries_by_nid(nid)
        .next()
        .map(|entry| String::from_utf8_lossy(entry.data().as_slice()).into_owned())
        .filter(|value| !value.is_empty())
}
