//! Per-connection SOCKS5 session state machine
//!
//! [`Session`] performs no IO. The driver in
//! [`handler`](crate::socks::handle_socks5_on_stream) feeds it readiness
//! events (downstream bytes, connect outcomes, closures) and carries out the
//! [`Step`] it returns. Keeping the protocol logic free of IO makes every
//! transition testable without sockets.
//!
//! ```text
//! INIT --methods--> METHOD_NEGOTIATED --(no auth)--> AUTHORIZED
//!      AUTHORIZED --CONNECT + upstream ok + reply flushed--> CONNECTED
//! any state --invalid input / failure / close--> CLOSED
//! ```

use crate::error::{ConnectError, Socks5Error, Socks5ReplyCode};
use crate::socks::auth::{decode_method_request, encode_method_reply, AuthMethod, AuthMethods};
use crate::socks::command::{parse_command, Reply};
use crate::socks::types::ConnectRequest;
use bytes::{Bytes, BytesMut};
use std::fmt;
use tracing::{debug, info, warn};

/// Session states, strictly forward-only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Waiting for the method-selection message
    Init,
    /// A method was selected
    MethodNegotiated,
    /// Reserved for credential sub-negotiation; never entered
    AuthInProgress,
    /// Waiting for the request, or for the upstream connect to resolve
    Authorized,
    /// Upstream connected; the session is a byte pump
    Connected,
    /// Terminal
    Closed,
}

const STATE_NAMES: [&str; 6] = [
    "INIT",
    "METHOD_NEGOTIATED",
    "AUTH_IN_PROGRESS",
    "AUTHORIZED",
    "CONNECTED",
    "CLOSED",
];

impl SessionState {
    /// Human-readable state name
    pub fn name(self) -> &'static str {
        STATE_NAMES[self as usize]
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the driver must do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Read more downstream bytes, then feed them again
    NeedMore,
    /// Write and flush these bytes before feeding more input
    Reply(Bytes),
    /// Write and flush these bytes, then close the downstream
    ReplyAndClose(Bytes),
    /// Write and flush the success reply, then call
    /// [`Session::confirm_connected`]
    ReplyAndRelay(Bytes),
    /// Dial the destination and report back via [`Session::on_upstream_result`]
    Connect(ConnectRequest),
    /// Handshake done; hand both channels to the relay
    Relay,
    /// Close without writing anything
    Close,
}

/// One SOCKS5 session, generic over the upstream channel type
///
/// The upstream channel is exposed only while the state is
/// [`SessionState::Connected`], which is entered once the success reply
/// has been flushed. It is dropped on every path into
/// [`SessionState::Closed`].
pub struct Session<U> {
    state: SessionState,
    methods: AuthMethods,
    auth_method: Option<AuthMethod>,
    request: Option<ConnectRequest>,
    connecting: bool,
    /// Connected upstream waiting for the success reply to be flushed
    pending_upstream: Option<U>,
    upstream: Option<U>,
    close_reason: Option<Socks5Error>,
}

impl<U> Session<U> {
    /// Create a session accepting the given authentication methods
    pub fn new(methods: AuthMethods) -> Self {
        Session {
            state: SessionState::Init,
            methods,
            auth_method: None,
            request: None,
            connecting: false,
            pending_upstream: None,
            upstream: None,
            close_reason: None,
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Negotiated authentication method
    pub fn auth_method(&self) -> Option<AuthMethod> {
        self.auth_method
    }

    /// Parsed CONNECT request, once received
    pub fn request(&self) -> Option<&ConnectRequest> {
        self.request.as_ref()
    }

    /// Whether a connect attempt is outstanding
    pub fn is_connecting(&self) -> bool {
        self.connecting
    }

    /// Upstream channel, present only while connected
    pub fn upstream_mut(&mut self) -> Option<&mut U> {
        self.upstream.as_mut()
    }

    /// Why the session closed after replying with an error, if it did
    pub fn close_reason(&self) -> Option<&Socks5Error> {
        self.close_reason.as_ref()
    }

    /// Deliver newly buffered downstream bytes
    ///
    /// Complete messages are consumed from `buf`; trailing bytes stay put.
    /// An `Err` means the downstream must be closed without a reply.
    pub fn on_bytes(&mut self, buf: &mut BytesMut) -> Result<Step, Socks5Error> {
        match self.state {
            SessionState::Init => self.negotiate(buf),
            SessionState::MethodNegotiated | SessionState::AuthInProgress => {
                let code = self.auth_method.map(AuthMethod::to_byte).unwrap_or_default();
                self.fail(Socks5Error::AuthMethodNotSupported(code))
            }
            SessionState::Authorized if self.connecting || self.pending_upstream.is_some() => {
                Ok(Step::NeedMore)
            }
            SessionState::Authorized => self.accept_request(buf),
            SessionState::Connected => Ok(Step::Relay),
            SessionState::Closed => Err(Socks5Error::SessionClosed),
        }
    }

    /// Deliver the outcome of the connect attempt started by [`Step::Connect`]
    ///
    /// If the session was closed in the meantime the outcome is discarded
    /// and a successfully connected upstream is dropped right away.
    pub fn on_upstream_result(&mut self, result: Result<U, ConnectError>) -> Step {
        if self.state != SessionState::Authorized || !self.connecting {
            match result {
                Ok(upstream) => {
                    debug!("Discarding upstream connected after session close");
                    drop(upstream);
                }
                Err(e) => debug!("Discarding connect failure after session close: {}", e),
            }
            return Step::Close;
        }

        self.connecting = false;

        match result {
            Ok(upstream) => {
                self.pending_upstream = Some(upstream);
                Step::ReplyAndRelay(Reply::success().encode())
            }
            Err(e) => {
                let code = e.reply_code();
                warn!("{} ({:?})", e, code);
                self.close_with(Socks5Error::UpstreamConnect(code));
                Step::ReplyAndClose(Reply::new(code).encode())
            }
        }
    }

    /// The success reply from [`Step::ReplyAndRelay`] has been flushed
    ///
    /// Moves the upstream into place and enters
    /// [`SessionState::Connected`]. Does nothing if no connect succeeded
    /// or the session has been closed since.
    pub fn confirm_connected(&mut self) {
        if self.state != SessionState::Authorized {
            return;
        }
        let Some(upstream) = self.pending_upstream.take() else {
            return;
        };

        self.upstream = Some(upstream);
        self.transition(SessionState::Connected);
        if let Some(request) = &self.request {
            info!("SOCKS5 tunnel established to {}", request.target());
        }
    }

    /// The downstream reached end-of-stream
    ///
    /// `unconsumed` is the number of buffered bytes no step has consumed.
    /// A partial handshake message is reported as malformed.
    pub fn on_downstream_closed(&mut self, unconsumed: usize) -> Result<(), Socks5Error> {
        let mid_message = unconsumed > 0
            && matches!(self.state, SessionState::Init | SessionState::Authorized)
            && !self.connecting
            && self.pending_upstream.is_none();
        if self.connecting {
            debug!("Downstream closed while connecting, outcome will be discarded");
        }
        self.close();

        if mid_message {
            return Err(Socks5Error::MalformedRequest(format!(
                "connection closed with {} bytes of an incomplete message",
                unconsumed
            )));
        }
        Ok(())
    }

    /// The upstream closed or the relay finished
    pub fn on_upstream_closed(&mut self) {
        self.close();
    }

    /// Tear down: drop the upstream and enter the terminal state
    pub fn close(&mut self) {
        self.connecting = false;
        self.pending_upstream = None;
        self.upstream = None;
        if self.state != SessionState::Closed {
            self.transition(SessionState::Closed);
        }
    }

    fn negotiate(&mut self, buf: &mut BytesMut) -> Result<Step, Socks5Error> {
        let request = match decode_method_request(buf) {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(Step::NeedMore),
            Err(e) => return self.fail(e),
        };

        let Some(method) = self.methods.select(&request.methods) else {
            debug!("Client offered methods {:02x?}", request.methods);
            self.close_with(Socks5Error::NoAcceptableMethod);
            return Ok(Step::ReplyAndClose(encode_method_reply(None)));
        };

        self.auth_method = Some(method);
        self.transition(SessionState::MethodNegotiated);

        if method.requires_subnegotiation() {
            return self.fail(Socks5Error::AuthMethodNotSupported(method.to_byte()));
        }

        debug!("Authentication completed with method: {}", method);
        self.transition(SessionState::Authorized);
        Ok(Step::Reply(encode_method_reply(Some(method))))
    }

    fn accept_request(&mut self, buf: &mut BytesMut) -> Result<Step, Socks5Error> {
        match parse_command(buf) {
            Ok(Some(request)) => {
                info!("SOCKS5 {} request", request);
                self.request = Some(request.clone());
                self.connecting = true;
                Ok(Step::Connect(request))
            }
            Ok(None) => Ok(Step::NeedMore),
            Err(e @ Socks5Error::CommandNotSupported(_)) => {
                self.close_with(e);
                Ok(Step::ReplyAndClose(
                    Reply::new(Socks5ReplyCode::CommandNotSupported).encode(),
                ))
            }
            Err(e @ Socks5Error::AddressTypeNotSupported(_)) => {
                self.close_with(e);
                Ok(Step::ReplyAndClose(
                    Reply::new(Socks5ReplyCode::AddressTypeNotSupported).encode(),
                ))
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, error: Socks5Error) -> Result<Step, Socks5Error> {
        self.close();
        Err(error)
    }

    fn close_with(&mut self, reason: Socks5Error) {
        self.close_reason.get_or_insert(reason);
        self.close();
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session state {} -> {}", self.state, next);
        self.state = next;
    }
}

impl<U> fmt::Debug for Session<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("auth_method", &self.auth_method)
            .field("request", &self.request)
            .field("connecting", &self.connecting)
            .field("has_pending_upstream", &self.pending_upstream.is_some())
            .field("has_upstream", &self.upstream.is_some())
            .field("close_reason", &self.close_reason)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks::types::TargetAddr;
    use std::io;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Upstream stand-in that records when it is dropped
    struct FakeUpstream {
        dropped: Arc<AtomicBool>,
    }

    impl FakeUpstream {
        fn new() -> (Self, Arc<AtomicBool>) {
            let dropped = Arc::new(AtomicBool::new(false));
            (
                FakeUpstream {
                    dropped: dropped.clone(),
                },
                dropped,
            )
        }
    }

    impl Drop for FakeUpstream {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    const CONNECT_LOCALHOST_8080: [u8; 10] =
        [0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x1F, 0x90];

    fn session() -> Session<FakeUpstream> {
        Session::new(AuthMethods::no_auth())
    }

    fn authorized_session() -> Session<FakeUpstream> {
        let mut session = session();
        let mut buf = BytesMut::from(&[0x05, 0x01, 0x00][..]);
        session.on_bytes(&mut buf).unwrap();
        assert_eq!(session.state(), SessionState::Authorized);
        session
    }

    fn connecting_session() -> Session<FakeUpstream> {
        let mut session = authorized_session();
        let mut buf = BytesMut::from(&CONNECT_LOCALHOST_8080[..]);
        let step = session.on_bytes(&mut buf).unwrap();
        assert!(matches!(step, Step::Connect(_)));
        session
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::Init.name(), "INIT");
        assert_eq!(SessionState::MethodNegotiated.name(), "METHOD_NEGOTIATED");
        assert_eq!(SessionState::AuthInProgress.name(), "AUTH_IN_PROGRESS");
        assert_eq!(SessionState::Authorized.name(), "AUTHORIZED");
        assert_eq!(SessionState::Connected.name(), "CONNECTED");
        assert_eq!(format!("{}", SessionState::Closed), "CLOSED");
    }

    #[test]
    fn test_no_auth_goes_straight_to_authorized() {
        for offered in [vec![0x00], vec![0x02, 0x00], vec![0x01, 0x02, 0x80, 0x00]] {
            let mut session = session();
            let mut buf = BytesMut::from(&[0x05, offered.len() as u8][..]);
            buf.extend_from_slice(&offered);

            let step = session.on_bytes(&mut buf).unwrap();

            assert_eq!(step, Step::Reply(Bytes::from_static(&[0x05, 0x00])));
            assert_eq!(session.state(), SessionState::Authorized);
            assert_eq!(session.auth_method(), Some(AuthMethod::None));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_no_acceptable_method_replies_ff_and_closes() {
        let mut session = session();
        let mut buf = BytesMut::from(&[0x05, 0x02, 0x01, 0x02][..]);

        let step = session.on_bytes(&mut buf).unwrap();

        assert_eq!(step, Step::ReplyAndClose(Bytes::from_static(&[0x05, 0xFF])));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason(), Some(&Socks5Error::NoAcceptableMethod));
        assert_eq!(session.on_bytes(&mut buf), Err(Socks5Error::SessionClosed));
    }

    #[test]
    fn test_wrong_version_closes_without_reply() {
        let mut session = session();
        let mut buf = BytesMut::from(&[0x04, 0x01, 0x00][..]);

        assert_eq!(
            session.on_bytes(&mut buf),
            Err(Socks5Error::UnsupportedVersion(4))
        );
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_partial_negotiation_waits() {
        let mut session = session();
        let mut buf = BytesMut::from(&[0x05, 0x02, 0x00][..]);

        assert_eq!(session.on_bytes(&mut buf).unwrap(), Step::NeedMore);
        assert_eq!(session.state(), SessionState::Init);

        buf.extend_from_slice(&[0x02]);
        assert!(matches!(session.on_bytes(&mut buf).unwrap(), Step::Reply(_)));
    }

    #[test]
    fn test_partial_negotiation_then_close_is_malformed() {
        let mut session = session();
        let mut buf = BytesMut::from(&[0x05, 0x03, 0x00][..]);
        assert_eq!(session.on_bytes(&mut buf).unwrap(), Step::NeedMore);

        let result = session.on_downstream_closed(buf.len());

        assert!(matches!(result, Err(Socks5Error::MalformedRequest(_))));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_subnegotiation_method_fails_closed() {
        let mut session: Session<FakeUpstream> =
            Session::new(AuthMethods::new(vec![AuthMethod::Password]));
        let mut buf = BytesMut::from(&[0x05, 0x01, 0x02][..]);

        assert_eq!(
            session.on_bytes(&mut buf),
            Err(Socks5Error::AuthMethodNotSupported(0x02))
        );
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_connect_request_starts_connect() {
        let mut session = authorized_session();
        let mut buf = BytesMut::from(&CONNECT_LOCALHOST_8080[..]);
        buf.extend_from_slice(b"early");

        let step = session.on_bytes(&mut buf).unwrap();

        let expected = ConnectRequest::new(TargetAddr::ipv4(Ipv4Addr::LOCALHOST, 8080));
        assert_eq!(step, Step::Connect(expected.clone()));
        assert_eq!(session.request(), Some(&expected));
        assert!(session.is_connecting());
        assert_eq!(session.state(), SessionState::Authorized);
        assert_eq!(&buf[..], b"early");

        // input is held back while the connect is outstanding
        assert_eq!(session.on_bytes(&mut buf).unwrap(), Step::NeedMore);
        assert_eq!(&buf[..], b"early");
    }

    #[test]
    fn test_upstream_success_replies_then_connects() {
        let mut session = connecting_session();
        let (upstream, _dropped) = FakeUpstream::new();

        let step = session.on_upstream_result(Ok(upstream));

        assert_eq!(
            step,
            Step::ReplyAndRelay(Bytes::from_static(&[
                0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00
            ]))
        );

        // not connected until the reply is out
        assert_eq!(session.state(), SessionState::Authorized);
        assert!(session.upstream_mut().is_none());
        let mut early = BytesMut::from(&b"early"[..]);
        assert_eq!(session.on_bytes(&mut early).unwrap(), Step::NeedMore);
        assert_eq!(&early[..], b"early");

        session.confirm_connected();

        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.upstream_mut().is_some());
        assert_eq!(session.on_bytes(&mut early).unwrap(), Step::Relay);
        assert_eq!(session.close_reason(), None);
    }

    #[test]
    fn test_close_before_reply_flushed_drops_upstream() {
        let mut session = connecting_session();
        let (upstream, dropped) = FakeUpstream::new();
        session.on_upstream_result(Ok(upstream));

        session.close();
        session.confirm_connected();

        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.upstream_mut().is_none());
    }

    #[test]
    fn test_confirm_without_connect_does_nothing() {
        let mut session = connecting_session();

        session.confirm_connected();

        assert_eq!(session.state(), SessionState::Authorized);
        assert!(session.is_connecting());
    }

    #[test]
    fn test_upstream_refused_maps_reply_code() {
        let mut session = connecting_session();
        let err = ConnectError::Io {
            target: "127.0.0.1:8080".to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };

        let step = session.on_upstream_result(Err(err));

        match step {
            Step::ReplyAndClose(reply) => {
                assert_eq!(reply.len(), 10);
                assert_eq!(reply[1], 0x05);
            }
            other => panic!("unexpected step {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.upstream_mut().is_none());
        assert_eq!(
            session.close_reason(),
            Some(&Socks5Error::UpstreamConnect(Socks5ReplyCode::ConnectionRefused))
        );
    }

    #[test]
    fn test_upstream_timeout_maps_ttl_expired() {
        let mut session = connecting_session();
        let err = ConnectError::Timeout {
            target: "127.0.0.1:8080".to_string(),
            after: std::time::Duration::from_secs(1),
        };

        match session.on_upstream_result(Err(err)) {
            Step::ReplyAndClose(reply) => assert_eq!(reply[1], 0x06),
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_downstream_close_during_connect_discards_upstream() {
        let mut session = connecting_session();
        session.on_downstream_closed(0).unwrap();
        assert_eq!(session.state(), SessionState::Closed);

        let (upstream, dropped) = FakeUpstream::new();
        let step = session.on_upstream_result(Ok(upstream));

        assert_eq!(step, Step::Close);
        assert!(dropped.load(Ordering::SeqCst));
        assert!(session.upstream_mut().is_none());
    }

    #[test]
    fn test_unsupported_command_replies_07() {
        for cmd in [0x02, 0x03, 0x7F] {
            let mut session = authorized_session();
            let mut buf = BytesMut::from(&[0x05, cmd, 0x00, 0x01][..]);

            match session.on_bytes(&mut buf).unwrap() {
                Step::ReplyAndClose(reply) => assert_eq!(reply[1], 0x07),
                other => panic!("unexpected step {:?}", other),
            }
            assert_eq!(session.state(), SessionState::Closed);
            assert_eq!(
                session.close_reason(),
                Some(&Socks5Error::CommandNotSupported(cmd))
            );
        }
    }

    #[test]
    fn test_unsupported_address_type_replies_08() {
        let mut session = authorized_session();
        let mut buf = BytesMut::from(&[0x05, 0x01, 0x00, 0x05][..]);

        match session.on_bytes(&mut buf).unwrap() {
            Step::ReplyAndClose(reply) => assert_eq!(reply[1], 0x08),
            other => panic!("unexpected step {:?}", other),
        }
        assert_eq!(
            session.close_reason(),
            Some(&Socks5Error::AddressTypeNotSupported(0x05))
        );
    }

    #[test]
    fn test_request_wrong_version_closes_without_reply() {
        let mut session = authorized_session();
        let mut buf = BytesMut::from(&[0x04, 0x01, 0x00, 0x01][..]);

        assert_eq!(
            session.on_bytes(&mut buf),
            Err(Socks5Error::UnsupportedVersion(4))
        );
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_upstream_closed_drops_channel() {
        let mut session = connecting_session();
        let (upstream, dropped) = FakeUpstream::new();
        session.on_upstream_result(Ok(upstream));
        session.confirm_connected();

        session.on_upstream_closed();

        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_downstream_close_while_connected_is_clean() {
        let mut session = connecting_session();
        let (upstream, dropped) = FakeUpstream::new();
        session.on_upstream_result(Ok(upstream));
        session.confirm_connected();

        assert!(session.on_downstream_closed(0).is_ok());
        assert!(dropped.load(Ordering::SeqCst));
    }
}
