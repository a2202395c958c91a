//! A minimal SIP user agent speaking SIP over WebSocket to a relay.
//!
//! Covers what a softphone leg needs: REGISTER with digest auth, outgoing
//! INVITE/ACK/CANCEL/BYE, inbound INVITE/ACK/BYE/CANCEL and DTMF via INFO.
//! No transaction timers or retransmissions: the relay sits on a reliable
//! transport.

use super::digest::{Challenge, DigestCredentials, authorization_header};
use super::message::{SipMessage, addr_display_name, addr_uri, header_param};
use super::stack::{SipAccount, SipError, SipStack, StackEvent};
use crate::calls::address::{uri_domain, uri_user};
use crate::calls::status::status_reason;
use crate::transport::{Transport, TransportEvent, TransportFactory};
use crate::types::media::SessionDescription;
use async_trait::async_trait;
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// WebSocket subprotocol for SIP (RFC 7118).
pub const SIP_SUBPROTOCOL: &str = "sip";

const USER_AGENT: &str = concat!("callcore/", env!("CARGO_PKG_VERSION"));
const REGISTER_EXPIRES: u32 = 600;

fn random_token() -> String {
    format!("{:012x}", rand::random::<u64>() & 0xffff_ffff_ffff)
}

fn with_tag(addr: &str, tag: &str) -> String {
    if header_param(addr, "tag").is_some() {
        addr.to_owned()
    } else {
        format!("{addr};tag={tag}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialogState {
    /// INVITE sent or received, no final response yet.
    Early,
    /// Inbound call answered with 200, waiting for ACK.
    Answered,
    Confirmed,
    /// CANCEL sent, waiting for the INVITE's final response.
    Cancelling,
}

struct Dialog {
    direction: Direction,
    state: DialogState,
    local_uri: String,
    remote_uri: String,
    local_tag: String,
    remote_tag: Option<String>,
    remote_target: String,
    cseq: u32,
    /// Outgoing: the last INVITE sent. Incoming: the INVITE received.
    invite: SipMessage,
    local_sdp: Option<String>,
    auth_retried: bool,
}

impl Dialog {
    fn local_addr(&self) -> String {
        format!("<{}>;tag={}", self.local_uri, self.local_tag)
    }

    fn remote_addr(&self) -> String {
        match &self.remote_tag {
            Some(tag) => format!("<{}>;tag={tag}", self.remote_uri),
            None => format!("<{}>", self.remote_uri),
        }
    }
}

struct Registration {
    account: SipAccount,
    domain: String,
    call_id: String,
    from_tag: String,
    cseq: u32,
    auth_retried: bool,
}

struct Shared {
    local_host: String,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    events: std::sync::Mutex<Option<mpsc::UnboundedSender<StackEvent>>>,
    account: Mutex<Option<SipAccount>>,
    registration: Mutex<Option<Registration>>,
    dialogs: Mutex<HashMap<String, Dialog>>,
}

pub struct WsSipStack {
    relay_url: String,
    transport_factory: Arc<dyn TransportFactory>,
    shared: Arc<Shared>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WsSipStack {
    pub fn new(relay_url: impl Into<String>, transport_factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            relay_url: relay_url.into(),
            transport_factory,
            shared: Arc::new(Shared {
                local_host: format!("{}.invalid", random_token()),
                transport: Mutex::new(None),
                events: std::sync::Mutex::new(None),
                account: Mutex::new(None),
                registration: Mutex::new(None),
                dialogs: Mutex::new(HashMap::new()),
            }),
            reader: std::sync::Mutex::new(None),
        }
    }

    async fn read_loop(shared: Arc<Shared>, mut transport_events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = transport_events.recv().await {
            match event {
                TransportEvent::Connected => debug!(target: "Call/Direct", "SIP relay connected"),
                TransportEvent::MessageReceived(text) => match SipMessage::parse(&text) {
                    Ok(msg) if msg.status().is_some() => shared.handle_response(msg).await,
                    Ok(msg) => shared.handle_request(msg).await,
                    Err(e) => warn!(target: "Call/Direct", "Dropping unparsable message: {e}"),
                },
                TransportEvent::Disconnected => {
                    info!(target: "Call/Direct", "SIP relay disconnected");
                    shared.transport.lock().await.take();
                    shared.dialogs.lock().await.clear();
                    shared.emit(StackEvent::Disconnected);
                    break;
                }
            }
        }
    }
}

impl Shared {
    fn emit(&self, event: StackEvent) {
        let tx = self.events.lock().ok().and_then(|g| g.clone());
        if let Some(tx) = tx {
            let _ = tx.send(event);
        }
    }

    async fn send(&self, msg: &SipMessage) -> Result<(), SipError> {
        let transport = self
            .transport
            .lock()
            .await
            .clone()
            .ok_or(SipError::NotStarted)?;
        let text = msg.to_string();
        trace!(target: "Call/Direct", "--> {}", text.lines().next().unwrap_or_default());
        transport
            .send_text(&text)
            .await
            .map_err(|e| SipError::Transport(e.to_string()))
    }

    /// Sends `msg`, logging instead of failing. For ACKs and responses.
    async fn send_quietly(&self, msg: &SipMessage) {
        if let Err(e) = self.send(msg).await {
            warn!(target: "Call/Direct", "Failed to send {:?}: {e}", msg.start);
        }
    }

    fn via(&self) -> String {
        format!(
            "SIP/2.0/WSS {};branch=z9hG4bK{}",
            self.local_host,
            random_token()
        )
    }

    fn contact(&self, uri: &str) -> String {
        let user = uri_user(uri).unwrap_or("anonymous");
        format!("<sip:{user}@{};transport=ws>", self.local_host)
    }

    fn new_request(
        &self,
        method: &str,
        request_uri: &str,
        from: &str,
        to: &str,
        call_id: &str,
        cseq: u32,
    ) -> SipMessage {
        SipMessage::request(method, request_uri)
            .with_header("Via", self.via())
            .with_header("Max-Forwards", "70")
            .with_header("From", from)
            .with_header("To", to)
            .with_header("Call-ID", call_id)
            .with_header("CSeq", format!("{cseq} {method}"))
            .with_header("User-Agent", USER_AGENT)
    }

    /// The `(header, value)` answering the challenge in `response`.
    fn answer_challenge(
        response: &SipMessage,
        account: &SipAccount,
        method: &str,
        uri: &str,
    ) -> Option<(&'static str, String)> {
        let (challenge_header, auth_header) = if response.status() == Some(407) {
            ("Proxy-Authenticate", "Proxy-Authorization")
        } else {
            ("WWW-Authenticate", "Authorization")
        };
        let challenge = Challenge::parse(response.header(challenge_header)?)?;
        let password = account.secret.as_deref()?;
        let username = account
            .auth_user
            .as_deref()
            .or_else(|| uri_user(&account.uri))?;
        let creds = DigestCredentials {
            username,
            password,
            method,
            uri,
        };
        Some((auth_header, authorization_header(&challenge, &creds, &random_token())))
    }

    fn build_register(&self, reg: &Registration, auth: Option<(&str, String)>) -> SipMessage {
        let uri = format!("<{}>", reg.account.uri);
        let mut msg = self
            .new_request(
                "REGISTER",
                &format!("sip:{}", reg.domain),
                &with_tag(&uri, &reg.from_tag),
                &uri,
                &reg.call_id,
                reg.cseq,
            )
            .with_header("Contact", format!("{};expires={REGISTER_EXPIRES}", self.contact(&reg.account.uri)))
            .with_header("Expires", REGISTER_EXPIRES.to_string());
        if let Some((name, value)) = auth {
            msg.set_header(name, value);
        }
        msg
    }

    async fn handle_response(&self, msg: SipMessage) {
        let Some((_, method)) = msg.cseq() else {
            debug!(target: "Call/Direct", "Response without CSeq, dropping");
            return;
        };
        match method {
            "REGISTER" => self.on_register_response(&msg).await,
            "INVITE" => self.on_invite_response(&msg).await,
            other => trace!(target: "Call/Direct", "{other} answered with {:?}", msg.status()),
        }
    }

    async fn on_register_response(&self, msg: &SipMessage) {
        let code = msg.status().unwrap_or_default();
        let mut guard = self.registration.lock().await;
        let Some(reg) = guard.as_mut().filter(|r| Some(r.call_id.as_str()) == msg.call_id()) else {
            debug!(target: "Call/Direct", "REGISTER response for an unknown registration");
            return;
        };

        match code {
            100..=199 => {}
            200..=299 => {
                info!(target: "Call/Direct", "Registered as {}", reg.account.uri);
                self.emit(StackEvent::Registered);
            }
            401 | 407 if !reg.auth_retried => {
                let uri = format!("sip:{}", reg.domain);
                match Self::answer_challenge(msg, &reg.account, "REGISTER", &uri) {
                    Some(auth) => {
                        reg.cseq += 1;
                        reg.auth_retried = true;
                        let request = self.build_register(reg, Some(auth));
                        drop(guard);
                        debug!(target: "Call/Direct", "Answering REGISTER challenge");
                        self.send_quietly(&request).await;
                    }
                    None => self.emit(StackEvent::RegistrationFailed {
                        code: Some(code),
                        reason: "Authentication required".into(),
                    }),
                }
            }
            _ => {
                let reason = msg.reason().unwrap_or(status_reason(code)).to_owned();
                warn!(target: "Call/Direct", "Registration rejected: {code} {reason}");
                self.emit(StackEvent::RegistrationFailed {
                    code: Some(code),
                    reason,
                });
            }
        }
    }

    /// ACK for a non-2xx final response: same branch as the INVITE.
    fn ack_failure(invite: &SipMessage, response: &SipMessage) -> SipMessage {
        let seq = invite.cseq().map_or(1, |(seq, _)| seq);
        let mut ack = SipMessage::request("ACK", invite.request_uri().unwrap_or_default());
        for (name, value) in [
            ("Via", invite.header("Via")),
            ("From", invite.header("From")),
            ("To", response.header("To")),
            ("Call-ID", invite.call_id()),
        ] {
            if let Some(value) = value {
                ack.headers.push((name.to_owned(), value.to_owned()));
            }
        }
        ack.with_header("CSeq", format!("{seq} ACK"))
            .with_header("Max-Forwards", "70")
    }

    async fn on_invite_response(&self, msg: &SipMessage) {
        let Some(call_id) = msg.call_id().map(str::to_owned) else {
            return;
        };
        let code = msg.status().unwrap_or_default();
        let mut dialogs = self.dialogs.lock().await;
        let Some(dialog) = dialogs
            .get_mut(&call_id)
            .filter(|d| d.direction == Direction::Outgoing)
        else {
            debug!(target: "Call/Direct", "INVITE response for unknown call {call_id}");
            return;
        };
        if let Some(tag) = msg.header("To").and_then(|to| header_param(to, "tag")) {
            dialog.remote_tag = Some(tag.to_owned());
        }

        match code {
            100 => {}
            101..=199 => {
                if dialog.state == DialogState::Early {
                    self.emit(StackEvent::Progress {
                        call_id,
                        code,
                    });
                }
            }
            200..=299 => {
                if let Some(contact) = msg.header("Contact") {
                    dialog.remote_target = addr_uri(contact).to_owned();
                }
                let seq = dialog.invite.cseq().map_or(1, |(seq, _)| seq);
                let ack = self.new_request(
                    "ACK",
                    &dialog.remote_target,
                    &dialog.local_addr(),
                    &dialog.remote_addr(),
                    &call_id,
                    seq,
                );
                let previous = dialog.state;
                dialog.state = DialogState::Confirmed;

                let bye = (previous == DialogState::Cancelling).then(|| {
                    dialog.cseq += 1;
                    self.new_request(
                        "BYE",
                        &dialog.remote_target,
                        &dialog.local_addr(),
                        &dialog.remote_addr(),
                        &call_id,
                        dialog.cseq,
                    )
                });
                if bye.is_some() {
                    dialogs.remove(&call_id);
                }
                drop(dialogs);

                self.send_quietly(&ack).await;
                match (previous, bye) {
                    (_, Some(bye)) => {
                        debug!(target: "Call/Direct", "Answered after CANCEL, sending BYE");
                        self.send_quietly(&bye).await;
                        self.emit(StackEvent::Ended {
                            call_id,
                            code: None,
                            reason: None,
                        });
                    }
                    (DialogState::Early, None) => {
                        let answer = msg.has_sdp().then(|| SessionDescription::answer(msg.body.clone()));
                        self.emit(StackEvent::Confirmed { call_id, answer });
                    }
                    _ => trace!(target: "Call/Direct", "Retransmitted 2xx for {call_id}"),
                }
            }
            401 | 407 if !dialog.auth_retried && dialog.state == DialogState::Early => {
                let ack = Self::ack_failure(&dialog.invite, msg);
                let account = self.account.lock().await.clone().unwrap_or_default();
                let target = dialog
                    .invite
                    .request_uri()
                    .unwrap_or(&dialog.remote_uri)
                    .to_owned();
                let auth = Self::answer_challenge(msg, &account, "INVITE", &target);
                let retry = auth.map(|(name, value)| {
                    dialog.cseq += 1;
                    dialog.auth_retried = true;
                    dialog.remote_tag = None;
                    let mut invite = self
                        .new_request(
                            "INVITE",
                            &target,
                            &dialog.local_addr(),
                            &format!("<{}>", dialog.remote_uri),
                            &call_id,
                            dialog.cseq,
                        )
                        .with_header("Contact", self.contact(&dialog.local_uri))
                        .with_body("application/sdp", dialog.invite.body.clone());
                    invite.set_header(name, value);
                    dialog.invite = invite.clone();
                    invite
                });
                if retry.is_none() {
                    dialogs.remove(&call_id);
                }
                drop(dialogs);

                self.send_quietly(&ack).await;
                match retry {
                    Some(invite) => {
                        debug!(target: "Call/Direct", "Answering INVITE challenge");
                        self.send_quietly(&invite).await;
                    }
                    None => self.emit(StackEvent::Failed {
                        call_id,
                        code,
                        reason: msg.reason().map(str::to_owned),
                    }),
                }
            }
            _ => {
                let ack = Self::ack_failure(&dialog.invite, msg);
                dialogs.remove(&call_id);
                drop(dialogs);
                self.send_quietly(&ack).await;
                self.emit(StackEvent::Failed {
                    call_id,
                    code,
                    reason: msg.reason().map(str::to_owned),
                });
            }
        }
    }

    async fn handle_request(&self, msg: SipMessage) {
        let method = msg.method().unwrap_or_default().to_owned();
        trace!(target: "Call/Direct", "<-- {method}");
        match method.as_str() {
            "INVITE" => self.on_invite(msg).await,
            "ACK" => {
                let Some(call_id) = msg.call_id() else { return };
                let mut dialogs = self.dialogs.lock().await;
                if let Some(dialog) = dialogs
                    .get_mut(call_id)
                    .filter(|d| d.state == DialogState::Answered)
                {
                    dialog.state = DialogState::Confirmed;
                    self.emit(StackEvent::Confirmed {
                        call_id: call_id.to_owned(),
                        answer: None,
                    });
                }
            }
            "BYE" => {
                let removed = match msg.call_id() {
                    Some(call_id) => self.dialogs.lock().await.remove(call_id),
                    None => None,
                };
                match removed {
                    Some(_) => {
                        self.send_quietly(&SipMessage::response_to(&msg, 200, "OK")).await;
                        self.emit(StackEvent::Ended {
                            call_id: msg.call_id().unwrap_or_default().to_owned(),
                            code: None,
                            reason: None,
                        });
                    }
                    None => {
                        self.send_quietly(&SipMessage::response_to(
                            &msg,
                            481,
                            "Call/Transaction Does Not Exist",
                        ))
                        .await
                    }
                }
            }
            "CANCEL" => self.on_cancel(msg).await,
            "INFO" | "OPTIONS" | "NOTIFY" => {
                self.send_quietly(&SipMessage::response_to(&msg, 200, "OK")).await
            }
            _ => {
                self.send_quietly(&SipMessage::response_to(&msg, 405, "Method Not Allowed"))
                    .await
            }
        }
    }

    async fn on_invite(&self, msg: SipMessage) {
        let Some(call_id) = msg.call_id().map(str::to_owned) else {
            return;
        };
        let mut dialogs = self.dialogs.lock().await;

        if let Some(dialog) = dialogs.get(&call_id) {
            // Re-INVITE: repeat the session we already agreed on.
            let response = match &dialog.local_sdp {
                Some(sdp) => SipMessage::response_to(&msg, 200, "OK")
                    .with_header("Contact", self.contact(&dialog.local_uri))
                    .with_body("application/sdp", sdp.clone()),
                None => SipMessage::response_to(&msg, 488, "Not Acceptable Here"),
            };
            drop(dialogs);
            self.send_quietly(&response).await;
            return;
        }
        if !msg.has_sdp() {
            drop(dialogs);
            self.send_quietly(&SipMessage::response_to(&msg, 488, "Not Acceptable Here"))
                .await;
            return;
        }

        let from = msg.header("From").unwrap_or_default();
        let to = msg.header("To").unwrap_or_default();
        let caller = addr_uri(from).to_owned();
        let display_name = addr_display_name(from);
        let local_tag = random_token();
        let dialog = Dialog {
            direction: Direction::Incoming,
            state: DialogState::Early,
            local_uri: addr_uri(to).to_owned(),
            remote_uri: caller.clone(),
            local_tag: local_tag.clone(),
            remote_tag: header_param(from, "tag").map(str::to_owned),
            remote_target: msg
                .header("Contact")
                .map_or_else(|| caller.clone(), |c| addr_uri(c).to_owned()),
            cseq: 0,
            invite: msg.clone(),
            local_sdp: None,
            auth_retried: false,
        };
        let offer = SessionDescription::offer(msg.body.clone());
        dialogs.insert(call_id.clone(), dialog);
        drop(dialogs);

        self.send_quietly(&SipMessage::response_to(&msg, 100, "Trying")).await;
        let mut ringing = SipMessage::response_to(&msg, 180, "Ringing");
        ringing.set_header("To", with_tag(to, &local_tag));
        self.send_quietly(&ringing).await;

        info!(target: "Call/Direct", "Incoming call from {caller}");
        self.emit(StackEvent::IncomingCall {
            call_id,
            caller,
            display_name,
            offer,
        });
    }

    async fn on_cancel(&self, msg: SipMessage) {
        let call_id = msg.call_id().unwrap_or_default().to_owned();
        let dialog = {
            let mut dialogs = self.dialogs.lock().await;
            match dialogs.get(&call_id) {
                Some(d) if d.direction == Direction::Incoming && d.state == DialogState::Early => {
                    dialogs.remove(&call_id)
                }
                _ => None,
            }
        };
        let Some(dialog) = dialog else {
            self.send_quietly(&SipMessage::response_to(
                &msg,
                481,
                "Call/Transaction Does Not Exist",
            ))
            .await;
            return;
        };

        self.send_quietly(&SipMessage::response_to(&msg, 200, "OK")).await;
        let mut terminated = SipMessage::response_to(&dialog.invite, 487, "Request Terminated");
        terminated.set_header(
            "To",
            with_tag(dialog.invite.header("To").unwrap_or_default(), &dialog.local_tag),
        );
        self.send_quietly(&terminated).await;
        self.emit(StackEvent::Ended {
            call_id,
            code: Some(487),
            reason: Some("Request Terminated".into()),
        });
    }

    /// A final response to the inbound INVITE of `dialog`, carrying our tag.
    fn final_response(&self, dialog: &Dialog, code: u16, reason: &str) -> SipMessage {
        let mut response = SipMessage::response_to(&dialog.invite, code, reason);
        response.set_header(
            "To",
            with_tag(dialog.invite.header("To").unwrap_or_default(), &dialog.local_tag),
        );
        response
    }
}

#[async_trait]
impl SipStack for WsSipStack {
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<StackEvent>, SipError> {
        let (transport, transport_events) = self
            .transport_factory
            .create_transport(&self.relay_url, Some(SIP_SUBPROTOCOL))
            .await
            .map_err(|e| SipError::Connect {
                url: self.relay_url.clone(),
                reason: e.to_string(),
            })?;
        *self.shared.transport.lock().await = Some(transport);

        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut events) = self.shared.events.lock() {
            *events = Some(tx);
        }
        let reader = tokio::spawn(Self::read_loop(self.shared.clone(), transport_events));
        if let Ok(mut slot) = self.reader.lock()
            && let Some(previous) = slot.replace(reader)
        {
            previous.abort();
        }
        info!(target: "Call/Direct", "Connected to SIP relay {}", self.relay_url);
        Ok(rx)
    }

    async fn register(&self, account: &SipAccount) -> Result<(), SipError> {
        let domain = uri_domain(&account.uri)
            .ok_or_else(|| SipError::Parse(format!("account URI has no domain: {}", account.uri)))?
            .to_owned();
        *self.shared.account.lock().await = Some(account.clone());

        let reg = Registration {
            account: account.clone(),
            domain,
            call_id: format!("{}@{}", random_token(), self.shared.local_host),
            from_tag: random_token(),
            cseq: 1,
            auth_retried: false,
        };
        let request = self.shared.build_register(&reg, None);
        *self.shared.registration.lock().await = Some(reg);
        debug!(target: "Call/Direct", "Sending REGISTER for {}", account.uri);
        self.shared.send(&request).await
    }

    async fn invite(&self, target: &str, offer: &SessionDescription) -> Result<String, SipError> {
        let local_uri = self
            .shared
            .account
            .lock()
            .await
            .as_ref()
            .map(|a| a.uri.clone())
            .ok_or(SipError::NotStarted)?;
        let call_id = format!("{}@{}", random_token(), self.shared.local_host);
        let local_tag = random_token();

        let invite = self
            .shared
            .new_request(
                "INVITE",
                target,
                &format!("<{local_uri}>;tag={local_tag}"),
                &format!("<{target}>"),
                &call_id,
                1,
            )
            .with_header("Contact", self.shared.contact(&local_uri))
            .with_body("application/sdp", offer.sdp.clone());

        self.shared.dialogs.lock().await.insert(
            call_id.clone(),
            Dialog {
                direction: Direction::Outgoing,
                state: DialogState::Early,
                local_uri,
                remote_uri: target.to_owned(),
                local_tag,
                remote_tag: None,
                remote_target: target.to_owned(),
                cseq: 1,
                invite: invite.clone(),
                local_sdp: Some(offer.sdp.clone()),
                auth_retried: false,
            },
        );
        if let Err(e) = self.shared.send(&invite).await {
            self.shared.dialogs.lock().await.remove(&call_id);
            return Err(e);
        }
        info!(target: "Call/Direct", "INVITE {target} ({call_id})");
        Ok(call_id)
    }

    async fn answer(&self, call_id: &str, answer: &SessionDescription) -> Result<(), SipError> {
        let response = {
            let mut dialogs = self.shared.dialogs.lock().await;
            let dialog = dialogs
                .get_mut(call_id)
                .filter(|d| d.direction == Direction::Incoming && d.state == DialogState::Early)
                .ok_or_else(|| SipError::UnknownCall(call_id.to_owned()))?;
            dialog.state = DialogState::Answered;
            dialog.local_sdp = Some(answer.sdp.clone());
            self.shared
                .final_response(dialog, 200, "OK")
                .with_header("Contact", self.shared.contact(&dialog.local_uri))
                .with_body("application/sdp", answer.sdp.clone())
        };
        self.shared.send(&response).await
    }

    async fn reject(&self, call_id: &str, code: u16) -> Result<(), SipError> {
        let dialog = self
            .shared
            .dialogs
            .lock()
            .await
            .remove(call_id)
            .ok_or_else(|| SipError::UnknownCall(call_id.to_owned()))?;
        let response = self
            .shared
            .final_response(&dialog, code, status_reason(code));
        self.shared.send(&response).await
    }

    async fn terminate(&self, call_id: &str) -> Result<(), SipError> {
        let request = {
            let mut dialogs = self.shared.dialogs.lock().await;
            let dialog = dialogs
                .get_mut(call_id)
                .ok_or_else(|| SipError::UnknownCall(call_id.to_owned()))?;
            match (dialog.direction, dialog.state) {
                (_, DialogState::Answered | DialogState::Confirmed) => {
                    dialog.cseq += 1;
                    let bye = self.shared.new_request(
                        "BYE",
                        &dialog.remote_target,
                        &dialog.local_addr(),
                        &dialog.remote_addr(),
                        call_id,
                        dialog.cseq,
                    );
                    dialogs.remove(call_id);
                    bye
                }
                (Direction::Outgoing, DialogState::Early) => {
                    dialog.state = DialogState::Cancelling;
                    let invite = &dialog.invite;
                    let seq = invite.cseq().map_or(1, |(seq, _)| seq);
                    let uri = invite.request_uri().unwrap_or(&dialog.remote_uri);
                    let mut cancel = SipMessage::request("CANCEL", uri);
                    for name in ["Via", "From", "To", "Call-ID"] {
                        if let Some(value) = invite.header(name) {
                            cancel.headers.push((name.to_owned(), value.to_owned()));
                        }
                    }
                    cancel
                        .with_header("CSeq", format!("{seq} CANCEL"))
                        .with_header("Max-Forwards", "70")
                }
                (Direction::Incoming, DialogState::Early) => {
                    let response = self.shared.final_response(dialog, 603, status_reason(603));
                    dialogs.remove(call_id);
                    response
                }
                (_, DialogState::Cancelling) => return Ok(()),
            }
        };
        self.shared.send(&request).await
    }

    async fn send_dtmf(&self, call_id: &str, digit: char) -> Result<(), SipError> {
        let info = {
            let mut dialogs = self.shared.dialogs.lock().await;
            let dialog = dialogs
                .get_mut(call_id)
                .filter(|d| matches!(d.state, DialogState::Answered | DialogState::Confirmed))
                .ok_or_else(|| SipError::UnknownCall(call_id.to_owned()))?;
            dialog.cseq += 1;
            self.shared
                .new_request(
                    "INFO",
                    &dialog.remote_target,
                    &dialog.local_addr(),
                    &dialog.remote_addr(),
                    call_id,
                    dialog.cseq,
                )
                .with_body(
                    "application/dtmf-relay",
                    format!("Signal={digit}\r\nDuration=160\r\n"),
                )
        };
        self.shared.send(&info).await
    }

    async fn stop(&self) {
        let reader = self.reader.lock().ok().and_then(|mut r| r.take());
        if let Some(reader) = reader {
            reader.abort();
        }
        if let Some(transport) = self.shared.transport.lock().await.take() {
            transport.disconnect().await;
        }
        self.shared.dialogs.lock().await.clear();
        self.shared.registration.lock().await.take();
        if let Ok(mut events) = self.shared.events.lock() {
            events.take();
        }
        debug!(target: "Call/Direct", "SIP stack stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockLink, MockTransportFactory};
    use std::time::Duration;

    const RELAY: &str = "wss://relay.example.com/ws";

    fn account() -> SipAccount {
        SipAccount {
            uri: "sip:2000@pbx.example.com".into(),
            secret: Some("hunter2".into()),
            auth_user: None,
            display_name: None,
        }
    }

    async fn started() -> (WsSipStack, MockLink, mpsc::UnboundedReceiver<StackEvent>) {
        let factory = MockTransportFactory::new();
        let link = factory.link();
        let stack = WsSipStack::new(RELAY, Arc::new(factory));
        let events = stack.start().await.unwrap();
        (stack, link, events)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<StackEvent>) -> StackEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    /// Builds a response to the `index`th sent request.
    fn reply(link: &MockLink, index: usize, code: u16, reason: &str) -> SipMessage {
        let sent = link.sent_messages();
        let request = SipMessage::parse(&sent[index]).unwrap();
        SipMessage::response_to(&request, code, reason)
    }

    #[tokio::test]
    async fn test_start_uses_sip_subprotocol() {
        let (_stack, link, _events) = started().await;
        assert_eq!(
            link.last_target(),
            Some((RELAY.to_owned(), Some("sip".to_owned())))
        );
    }

    #[tokio::test]
    async fn test_unreachable_relay_fails_start() {
        let stack = WsSipStack::new(RELAY, Arc::new(MockTransportFactory::unreachable()));
        assert!(matches!(stack.start().await, Err(SipError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_register_answers_digest_challenge() {
        let (stack, link, mut events) = started().await;
        stack.register(&account()).await.unwrap();
        let sent = link.wait_for_sent(1).await;
        assert!(sent[0].starts_with("REGISTER sip:pbx.example.com SIP/2.0"));

        let challenge = reply(&link, 0, 401, "Unauthorized").with_header(
            "WWW-Authenticate",
            r#"Digest realm="pbx.example.com", nonce="abc123""#,
        );
        link.inject(challenge.to_string()).await;

        let sent = link.wait_for_sent(2).await;
        let retry = SipMessage::parse(&sent[1]).unwrap();
        assert_eq!(retry.cseq(), Some((2, "REGISTER")));
        let auth = retry.header("Authorization").unwrap();
        assert!(auth.contains("username=\"2000\""));
        assert!(auth.contains("uri=\"sip:pbx.example.com\""));

        link.inject(reply(&link, 1, 200, "OK").to_string()).await;
        assert!(matches!(next_event(&mut events).await, StackEvent::Registered));
    }

    #[tokio::test]
    async fn test_second_challenge_fails_registration() {
        let (stack, link, mut events) = started().await;
        stack.register(&account()).await.unwrap();
        link.wait_for_sent(1).await;
        let header = r#"Digest realm="pbx.example.com", nonce="n1""#;
        link.inject(reply(&link, 0, 401, "Unauthorized").with_header("WWW-Authenticate", header).to_string())
            .await;
        link.wait_for_sent(2).await;
        link.inject(reply(&link, 1, 403, "Forbidden").to_string()).await;

        match next_event(&mut events).await {
            StackEvent::RegistrationFailed { code, reason } => {
                assert_eq!(code, Some(403));
                assert_eq!(reason, "Forbidden");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_outgoing_call_progress_and_answer() {
        let (stack, link, mut events) = started().await;
        stack.register(&account()).await.unwrap();
        let call_id = stack
            .invite("sip:1001@pbx.example.com", &SessionDescription::offer("v=0 offer"))
            .await
            .unwrap();
        let sent = link.wait_for_sent(2).await;
        let invite = SipMessage::parse(&sent[1]).unwrap();
        assert_eq!(invite.method(), Some("INVITE"));
        assert_eq!(invite.body, "v=0 offer");

        let mut ringing = reply(&link, 1, 180, "Ringing");
        ringing.set_header("To", "<sip:1001@pbx.example.com>;tag=far");
        link.inject(ringing.to_string()).await;
        assert!(matches!(
            next_event(&mut events).await,
            StackEvent::Progress { code: 180, .. }
        ));

        let mut ok = reply(&link, 1, 200, "OK")
            .with_header("Contact", "<sip:1001@10.0.0.9;transport=ws>")
            .with_body("application/sdp", "v=0 answer");
        ok.set_header("To", "<sip:1001@pbx.example.com>;tag=far");
        link.inject(ok.to_string()).await;
        match next_event(&mut events).await {
            StackEvent::Confirmed { call_id: id, answer } => {
                assert_eq!(id, call_id);
                assert_eq!(answer.unwrap().sdp, "v=0 answer");
            }
            other => panic!("unexpected {other:?}"),
        }
        let sent = link.wait_for_sent(3).await;
        assert!(sent[2].starts_with("ACK sip:1001@10.0.0.9;transport=ws SIP/2.0"));

        stack.terminate(&call_id).await.unwrap();
        let sent = link.wait_for_sent(4).await;
        let bye = SipMessage::parse(&sent[3]).unwrap();
        assert_eq!(bye.method(), Some("BYE"));
        assert!(bye.header("To").unwrap().contains("tag=far"));
    }

    #[tokio::test]
    async fn test_cancel_then_487_reports_failure() {
        let (stack, link, mut events) = started().await;
        stack.register(&account()).await.unwrap();
        let call_id = stack
            .invite("sip:1001@pbx.example.com", &SessionDescription::offer("v=0"))
            .await
            .unwrap();
        link.wait_for_sent(2).await;

        stack.terminate(&call_id).await.unwrap();
        let sent = link.wait_for_sent(3).await;
        let cancel = SipMessage::parse(&sent[2]).unwrap();
        let invite = SipMessage::parse(&sent[1]).unwrap();
        assert_eq!(cancel.method(), Some("CANCEL"));
        assert_eq!(cancel.header("Via"), invite.header("Via"));

        link.inject(reply(&link, 1, 487, "Request Terminated").to_string()).await;
        assert!(matches!(
            next_event(&mut events).await,
            StackEvent::Failed { code: 487, .. }
        ));
        let sent = link.wait_for_sent(4).await;
        assert!(sent[3].starts_with("ACK "));
    }

    const INBOUND_INVITE: &str = "INVITE sip:2000@client.invalid;transport=ws SIP/2.0\r\n\
        Via: SIP/2.0/WSS relay.example.com;branch=z9hG4bKin1\r\n\
        From: \"Alice\" <sip:1001@pbx.example.com>;tag=alice\r\n\
        To: <sip:2000@pbx.example.com>\r\n\
        Call-ID: inbound-1\r\n\
        CSeq: 10 INVITE\r\n\
        Contact: <sip:1001@10.0.0.9;transport=ws>\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: 9\r\n\
        \r\n\
        v=0 offer";

    #[tokio::test]
    async fn test_inbound_call_answer_and_ack() {
        let (stack, link, mut events) = started().await;
        link.inject(INBOUND_INVITE).await;

        match next_event(&mut events).await {
            StackEvent::IncomingCall {
                call_id,
                caller,
                display_name,
                offer,
            } => {
                assert_eq!(call_id, "inbound-1");
                assert_eq!(caller, "sip:1001@pbx.example.com");
                assert_eq!(display_name.as_deref(), Some("Alice"));
                assert_eq!(offer.sdp, "v=0 offer");
            }
            other => panic!("unexpected {other:?}"),
        }
        let sent = link.wait_for_sent(2).await;
        assert!(sent[0].starts_with("SIP/2.0 100 Trying"));
        assert!(sent[1].starts_with("SIP/2.0 180 Ringing"));

        stack
            .answer("inbound-1", &SessionDescription::answer("v=0 answer"))
            .await
            .unwrap();
        let sent = link.wait_for_sent(3).await;
        let ok = SipMessage::parse(&sent[2]).unwrap();
        assert_eq!(ok.status(), Some(200));
        assert_eq!(ok.cseq(), Some((10, "INVITE")));
        assert!(ok.header("To").unwrap().contains(";tag="));

        link.inject(
            "ACK sip:2000@client.invalid SIP/2.0\r\nCall-ID: inbound-1\r\nCSeq: 10 ACK\r\n\r\n",
        )
        .await;
        assert!(matches!(
            next_event(&mut events).await,
            StackEvent::Confirmed { answer: None, .. }
        ));

        stack.send_dtmf("inbound-1", '5').await.unwrap();
        let sent = link.wait_for_sent(4).await;
        let info = SipMessage::parse(&sent[3]).unwrap();
        assert_eq!(info.method(), Some("INFO"));
        assert_eq!(info.body, "Signal=5\r\nDuration=160\r\n");
    }

    #[tokio::test]
    async fn test_inbound_bye_and_cancel() {
        let (_stack, link, mut events) = started().await;
        link.inject(INBOUND_INVITE).await;
        next_event(&mut events).await;

        link.inject(
            "CANCEL sip:2000@client.invalid SIP/2.0\r\nVia: SIP/2.0/WSS relay.example.com;branch=z9hG4bKin1\r\nCall-ID: inbound-1\r\nCSeq: 10 CANCEL\r\n\r\n",
        )
        .await;
        match next_event(&mut events).await {
            StackEvent::Ended { code, .. } => assert_eq!(code, Some(487)),
            other => panic!("unexpected {other:?}"),
        }
        let sent = link.wait_for_sent(4).await;
        assert!(sent[2].starts_with("SIP/2.0 200 OK"));
        assert!(sent[3].starts_with("SIP/2.0 487 Request Terminated"));

        link.inject("BYE sip:2000@client.invalid SIP/2.0\r\nCall-ID: inbound-1\r\nCSeq: 11 BYE\r\n\r\n")
            .await;
        let sent = link.wait_for_sent(5).await;
        assert!(sent[4].starts_with("SIP/2.0 481"));
    }

    #[tokio::test]
    async fn test_disconnect_is_reported() {
        let (_stack, link, mut events) = started().await;
        link.close_from_server().await;
        assert!(matches!(next_event(&mut events).await, StackEvent::Disconnected));
    }
}
