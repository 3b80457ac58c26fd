//! Maps failure causes onto a closed taxonomy with a retryability flag.
//!
//! Classification looks at the cause category first. Free-text causes fall back
//! to inspecting the message for HTTP-style status codes.

use std::fmt;
use std::io;

/// What went wrong, as reported by whichever layer observed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    DnsResolution(String),
    ConnectionRefused(String),
    NoRouteToHost(String),
    PortUnreachable(String),
    Timeout(String),
    TlsHandshake(String),
    PeerUnverified(String),
    TlsProtocol(String),
    Tls(String),
    Certificate(String),
    Protocol(String),
    UnknownService(String),
    Socket(String),
    Io(String),
    /// Anything else; classified by inspecting the text.
    Message(String),
}

impl FailureCause {
    pub fn detail(&self) -> &str {
        match self {
            Self::DnsResolution(d)
            | Self::ConnectionRefused(d)
            | Self::NoRouteToHost(d)
            | Self::PortUnreachable(d)
            | Self::Timeout(d)
            | Self::TlsHandshake(d)
            | Self::PeerUnverified(d)
            | Self::TlsProtocol(d)
            | Self::Tls(d)
            | Self::Certificate(d)
            | Self::Protocol(d)
            | Self::UnknownService(d)
            | Self::Socket(d)
            | Self::Io(d)
            | Self::Message(d) => d,
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self {
            Self::DnsResolution(_) => "DNS resolution failed",
            Self::ConnectionRefused(_) => "Connection refused",
            Self::NoRouteToHost(_) => "No route to host",
            Self::PortUnreachable(_) => "Port unreachable",
            Self::Timeout(_) => "Timeout",
            Self::TlsHandshake(_) => "TLS handshake failed",
            Self::PeerUnverified(_) => "TLS peer unverified",
            Self::TlsProtocol(_) => "TLS protocol error",
            Self::Tls(_) => "TLS error",
            Self::Certificate(_) => "Certificate error",
            Self::Protocol(_) => "Protocol error",
            Self::UnknownService(_) => "Unknown service",
            Self::Socket(_) => "Socket error",
            Self::Io(_) => "IO error",
            Self::Message(message) => return f.write_str(message),
        };
        write!(f, "{prefix}: {}", self.detail())
    }
}

impl From<&io::Error> for FailureCause {
    fn from(err: &io::Error) -> Self {
        let detail = err.to_string();
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused(detail),
            io::ErrorKind::TimedOut => Self::Timeout(detail),
            io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                Self::NoRouteToHost(detail)
            }
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::AddrNotAvailable => Self::Socket(detail),
            _ => Self::Io(detail),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Network,
    Timeout,
    Authentication,
    Ssl,
    Server,
    Client,
    Unknown,
}

impl ErrorType {
    /// Failures shown to the user as connectivity problems rather than rejections.
    pub fn is_network(self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::Ssl)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub error_type: ErrorType,
    pub is_retryable: bool,
    pub message_key: &'static str,
    pub technical_details: Option<String>,
}

impl ErrorInfo {
    fn new(error_type: ErrorType, message_key: &'static str, details: String) -> Self {
        let is_retryable = matches!(
            error_type,
            ErrorType::Network | ErrorType::Timeout | ErrorType::Server
        );
        Self {
            error_type,
            is_retryable,
            message_key,
            technical_details: Some(details),
        }
    }

    pub fn is_network_error(&self) -> bool {
        self.error_type.is_network()
    }

    /// User-facing copy for the message key.
    pub fn user_message(&self) -> &'static str {
        match self.message_key {
            "error_network_dns" => "Unable to reach the server. Please check your internet connection.",
            "error_network_connection" => "Could not connect to the server. Please try again.",
            "error_network_no_route" => "The server is unreachable from your network.",
            "error_network_port_unreachable" => "The server is not accepting connections.",
            "error_network_socket" => "The connection was interrupted. Please try again.",
            "error_network_io" => "A network error occurred. Please try again.",
            "error_timeout" => "The request timed out. Please try again.",
            "error_ssl_handshake" => "A secure connection could not be established.",
            "error_ssl_peer_unverified" => "The server identity could not be verified.",
            "error_ssl_protocol" => "A secure connection protocol error occurred.",
            "error_ssl_general" => "A secure connection error occurred.",
            "error_certificate" => "The server certificate is not trusted.",
            "error_client_protocol" => "The request could not be understood.",
            "error_client_service_unknown" => "The requested service is not available.",
            "error_client_not_found" => "The requested resource was not found.",
            "error_auth_unauthorized" => "Your session has expired. Please sign in again.",
            "error_auth_forbidden" => "You do not have permission to perform this action.",
            "error_server_internal" => "The server encountered an error. Please try again later.",
            "error_server_bad_gateway" => "The server is temporarily unreachable. Please try again later.",
            "error_server_unavailable" => "The service is temporarily unavailable. Please try again later.",
            _ => "An unexpected error occurred.",
        }
    }
}

pub fn classify(cause: &FailureCause) -> ErrorInfo {
    let details = cause.to_string();
    match cause {
        FailureCause::DnsResolution(_) => ErrorInfo::new(ErrorType::Network, "error_network_dns", details),
        FailureCause::ConnectionRefused(_) => {
            ErrorInfo::new(ErrorType::Network, "error_network_connection", details)
        }
        FailureCause::NoRouteToHost(_) => {
            ErrorInfo::new(ErrorType::Network, "error_network_no_route", details)
        }
        FailureCause::PortUnreachable(_) => {
            ErrorInfo::new(ErrorType::Network, "error_network_port_unreachable", details)
        }
        FailureCause::Timeout(_) => ErrorInfo::new(ErrorType::Timeout, "error_timeout", details),
        FailureCause::TlsHandshake(_) => ErrorInfo::new(ErrorType::Ssl, "error_ssl_handshake", details),
        FailureCause::PeerUnverified(_) => {
            ErrorInfo::new(ErrorType::Ssl, "error_ssl_peer_unverified", details)
        }
        FailureCause::TlsProtocol(_) => ErrorInfo::new(ErrorType::Ssl, "error_ssl_protocol", details),
        FailureCause::Tls(_) => ErrorInfo::new(ErrorType::Ssl, "error_ssl_general", details),
        FailureCause::Certificate(_) => ErrorInfo::new(ErrorType::Ssl, "error_certificate", details),
        FailureCause::Protocol(_) => ErrorInfo::new(ErrorType::Client, "error_client_protocol", details),
        FailureCause::UnknownService(_) => {
            ErrorInfo::new(ErrorType::Client, "error_client_service_unknown", details)
        }
        FailureCause::Socket(_) => ErrorInfo::new(ErrorType::Network, "error_network_socket", details),
        FailureCause::Io(_) => ErrorInfo::new(ErrorType::Network, "error_network_io", details),
        FailureCause::Message(message) => classify_message(message),
    }
}

fn classify_message(message: &str) -> ErrorInfo {
    let lower = message.to_lowercase();
    let status = status_code(&lower);
    let details = message.to_string();

    if status == Some(401) || lower.contains("unauthorized") {
        ErrorInfo::new(ErrorType::Authentication, "error_auth_unauthorized", details)
    } else if status == Some(403) || lower.contains("forbidden") {
        ErrorInfo::new(ErrorType::Authentication, "error_auth_forbidden", details)
    } else if status == Some(404) || lower.contains("not found") {
        ErrorInfo::new(ErrorType::Client, "error_client_not_found", details)
    } else if status == Some(502) || lower.contains("bad gateway") {
        ErrorInfo::new(ErrorType::Server, "error_server_bad_gateway", details)
    } else if status == Some(503) || lower.contains("service unavailable") {
        ErrorInfo::new(ErrorType::Server, "error_server_unavailable", details)
    } else if status.is_some_and(|code| (500..600).contains(&code))
        || lower.contains("internal server")
    {
        ErrorInfo::new(ErrorType::Server, "error_server_internal", details)
    } else {
        ErrorInfo::new(ErrorType::Unknown, "error_unknown", details)
    }
}

/// First standalone three-digit number in the 400..600 range.
fn status_code(message: &str) -> Option<u16> {
    message
        .split(|c: char| !c.is_ascii_digit())
        .filter(|token| token.len() == 3)
        .filter_map(|token| token.parse::<u16>().ok())
        .find(|code| (400..600).contains(code))
}
