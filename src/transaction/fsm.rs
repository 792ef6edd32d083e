use rsip::{Request, Response, SipMessage, StatusCodeKind};
use std::{fmt, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionType {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

impl TransactionType {
    pub fn is_client(&self) -> bool {
        matches!(
            self,
            TransactionType::ClientInvite | TransactionType::ClientNonInvite
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    /// RFC 6026: a client INVITE that saw a 2xx lingers here so 2xx
    /// retransmissions and forked 2xx still reach the dialog.
    Accepted,
    Confirmed,
    Terminated,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionTimer {
    TimerA,
    TimerB,
    TimerD,
    TimerE,
    TimerF,
    TimerG,
    TimerH,
    TimerI,
    TimerJ,
    TimerK,
    TimerM,
}

impl fmt::Display for TransactionTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Completed,
    Timeout,
    TransportFailure,
}

#[derive(Debug, Clone)]
pub enum TransactionInput {
    /// Client only: transmit the request that opens the transaction.
    Send(Request),
    Received(SipMessage),
    /// Server only: a response from the transaction user.
    Respond(Response),
    Timer(TransactionTimer),
    /// Client INVITE only: the TU wants the request cancelled.
    Cancel,
    TransportError,
}

#[derive(Debug, Clone)]
pub enum TransactionAction {
    Transmit(SipMessage),
    Deliver(SipMessage),
    /// Build and send the ACK for a non-2xx final response.
    Acknowledge(Response),
    Schedule(TransactionTimer, Duration),
    Unschedule(TransactionTimer),
    SendCancel,
    Terminate(TransactionOutcome),
}

#[derive(Debug, Clone, Copy)]
pub struct TransactionTimers {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
}

impl Default for TransactionTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

/// Sans-IO transaction state machine. `on_event` never blocks and never
/// touches the network; the endpoint executes the returned actions.
pub struct TransactionFsm {
    pub transaction_type: TransactionType,
    pub state: TransactionState,
    reliable: bool,
    timers: TransactionTimers,
    interval: Duration,
    last_request: Option<Request>,
    last_response: Option<Response>,
    cancel_pending: bool,
    cancel_sent: bool,
}

use TransactionAction as Action;
use TransactionState::*;

impl TransactionFsm {
    pub fn new(
        transaction_type: TransactionType,
        reliable: bool,
        timers: TransactionTimers,
    ) -> Self {
        let state = match transaction_type {
            TransactionType::ClientInvite => Calling,
            TransactionType::ClientNonInvite | TransactionType::ServerNonInvite => Trying,
            TransactionType::ServerInvite => Proceeding,
        };
        Self {
            transaction_type,
            state,
            reliable,
            timers,
            interval: timers.t1,
            last_request: None,
            last_response: None,
            cancel_pending: false,
            cancel_sent: false,
        }
    }

    pub fn last_response(&self) -> Option<&Response> {
        self.last_response.as_ref()
    }

    pub fn can_cancel(&self) -> bool {
        self.transaction_type == TransactionType::ClientInvite
            && matches!(self.state, Calling | Proceeding)
            && !self.cancel_pending
            && !self.cancel_sent
    }

    pub fn can_respond(&self) -> bool {
        !self.transaction_type.is_client() && matches!(self.state, Trying | Proceeding)
    }

    fn timeout_interval(&self) -> Duration {
        self.timers.t1 * 64
    }

    /// Timers D, I, J and K absorb retransmissions that only happen on
    /// unreliable transports, so they collapse to zero otherwise.
    fn linger(&mut self, timer: TransactionTimer, duration: Duration) -> Vec<Action> {
        if self.reliable {
            self.terminate(TransactionOutcome::Completed)
        } else {
            vec![Action::Schedule(timer, duration)]
        }
    }

    fn terminate(&mut self, outcome: TransactionOutcome) -> Vec<Action> {
        self.state = Terminated;
        vec![Action::Terminate(outcome)]
    }

    pub fn on_event(&mut self, input: TransactionInput) -> Vec<Action> {
        if self.state == Terminated {
            return vec![];
        }
        if let TransactionInput::TransportError = input {
            return self.terminate(TransactionOutcome::TransportFailure);
        }
        match self.transaction_type {
            TransactionType::ClientInvite => self.on_client_invite(input),
            TransactionType::ClientNonInvite => self.on_client_non_invite(input),
            TransactionType::ServerInvite => self.on_server_invite(input),
            TransactionType::ServerNonInvite => self.on_server_non_invite(input),
        }
    }

    fn on_client_invite(&mut self, input: TransactionInput) -> Vec<Action> {
        match (self.state, input) {
            (Calling, TransactionInput::Send(req)) => {
                let mut actions = vec![Action::Transmit(req.clone().into())];
                self.last_request = Some(req);
                if !self.reliable {
                    actions.push(Action::Schedule(TransactionTimer::TimerA, self.interval));
                }
                actions.push(Action::Schedule(
                    TransactionTimer::TimerB,
                    self.timeout_interval(),
                ));
                actions
            }
            (Calling, TransactionInput::Timer(TransactionTimer::TimerA)) => {
                let Some(req) = self.last_request.clone() else {
                    return vec![];
                };
                self.interval *= 2;
                vec![
                    Action::Transmit(req.into()),
                    Action::Schedule(TransactionTimer::TimerA, self.interval),
                ]
            }
            (Calling | Proceeding, TransactionInput::Timer(TransactionTimer::TimerB)) => {
                self.terminate(TransactionOutcome::Timeout)
            }
            (Calling, TransactionInput::Cancel) => {
                self.cancel_pending = true;
                vec![]
            }
            (Proceeding, TransactionInput::Cancel) if !self.cancel_sent => self.send_cancel(),
            (Calling | Proceeding, TransactionInput::Received(SipMessage::Response(resp))) => {
                let was_calling = self.state == Calling;
                let mut actions = vec![];
                if was_calling {
                    actions.push(Action::Unschedule(TransactionTimer::TimerA));
                }
                match resp.status_code.kind() {
                    StatusCodeKind::Provisional => {
                        self.state = Proceeding;
                        if was_calling {
                            actions.push(Action::Unschedule(TransactionTimer::TimerB));
                        }
                        actions.push(Action::Deliver(resp.into()));
                        if self.cancel_pending && !self.cancel_sent {
                            actions.extend(self.send_cancel());
                        }
                    }
                    StatusCodeKind::Successful => {
                        self.state = Accepted;
                        actions.push(Action::Unschedule(TransactionTimer::TimerB));
                        actions.push(Action::Deliver(resp.into()));
                        actions.push(Action::Schedule(
                            TransactionTimer::TimerM,
                            self.timeout_interval(),
                        ));
                    }
                    _ => {
                        self.state = Completed;
                        actions.push(Action::Unschedule(TransactionTimer::TimerB));
                        self.last_response = Some(resp.clone());
                        actions.push(Action::Deliver(resp.clone().into()));
                        actions.push(Action::Acknowledge(resp));
                        let wait = self.timeout_interval();
                        actions.extend(self.linger(TransactionTimer::TimerD, wait));
                    }
                }
                actions
            }
            (Accepted, TransactionInput::Received(SipMessage::Response(resp)))
                if resp.status_code.kind() == StatusCodeKind::Successful =>
            {
                vec![Action::Deliver(resp.into())]
            }
            (Accepted, TransactionInput::Timer(TransactionTimer::TimerM)) => {
                self.terminate(TransactionOutcome::Completed)
            }
            (Completed, TransactionInput::Received(SipMessage::Response(resp)))
                if !matches!(
                    resp.status_code.kind(),
                    StatusCodeKind::Provisional | StatusCodeKind::Successful
                ) =>
            {
                vec![Action::Acknowledge(resp)]
            }
            (Completed, TransactionInput::Timer(TransactionTimer::TimerD)) => {
                self.terminate(TransactionOutcome::Completed)
            }
            _ => vec![],
        }
    }

    fn send_cancel(&mut self) -> Vec<Action> {
        self.cancel_sent = true;
        vec![
            Action::SendCancel,
            Action::Schedule(TransactionTimer::TimerB, self.timeout_interval()),
        ]
    }

    fn on_client_non_invite(&mut self, input: TransactionInput) -> Vec<Action> {
        match (self.state, input) {
            (Trying, TransactionInput::Send(req)) => {
                let mut actions = vec![Action::Transmit(req.clone().into())];
                self.last_request = Some(req);
                if !self.reliable {
                    actions.push(Action::Schedule(TransactionTimer::TimerE, self.interval));
                }
                actions.push(Action::Schedule(
                    TransactionTimer::TimerF,
                    self.timeout_interval(),
                ));
                actions
            }
            (Trying | Proceeding, TransactionInput::Timer(TransactionTimer::TimerE)) => {
                let Some(req) = self.last_request.clone() else {
                    return vec![];
                };
                self.interval = match self.state {
                    Trying => (self.interval * 2).min(self.timers.t2),
                    _ => self.timers.t2,
                };
                vec![
                    Action::Transmit(req.into()),
                    Action::Schedule(TransactionTimer::TimerE, self.interval),
                ]
            }
            (Trying | Proceeding, TransactionInput::Timer(TransactionTimer::TimerF)) => {
                self.terminate(TransactionOutcome::Timeout)
            }
            (Trying | Proceeding, TransactionInput::Received(SipMessage::Response(resp))) => {
                if resp.status_code.kind() == StatusCodeKind::Provisional {
                    self.state = Proceeding;
                    return vec![Action::Deliver(resp.into())];
                }
                self.state = Completed;
                self.last_response = Some(resp.clone());
                let mut actions = vec![
                    Action::Unschedule(TransactionTimer::TimerE),
                    Action::Unschedule(TransactionTimer::TimerF),
                    Action::Deliver(resp.into()),
                ];
                let wait = self.timers.t4;
                actions.extend(self.linger(TransactionTimer::TimerK, wait));
                actions
            }
            (Completed, TransactionInput::Timer(TransactionTimer::TimerK)) => {
                self.terminate(TransactionOutcome::Completed)
            }
            _ => vec![],
        }
    }

    fn on_server_invite(&mut self, input: TransactionInput) -> Vec<Action> {
        match (self.state, input) {
            (Proceeding, TransactionInput::Respond(resp)) => {
                self.last_response = Some(resp.clone());
                if resp.status_code.kind() == StatusCodeKind::Provisional {
                    return vec![Action::Transmit(resp.into())];
                }
                self.state = Completed;
                let mut actions = vec![Action::Transmit(resp.into())];
                if !self.reliable {
                    actions.push(Action::Schedule(TransactionTimer::TimerG, self.interval));
                }
                actions.push(Action::Schedule(
                    TransactionTimer::TimerH,
                    self.timeout_interval(),
                ));
                actions
            }
            (Proceeding | Completed, TransactionInput::Received(SipMessage::Request(req)))
                if req.method == rsip::Method::Invite =>
            {
                match &self.last_response {
                    Some(resp) => vec![Action::Transmit(resp.clone().into())],
                    None => vec![],
                }
            }
            (Proceeding, TransactionInput::Received(SipMessage::Request(req)))
                if req.method == rsip::Method::Cancel =>
            {
                vec![Action::Deliver(req.into())]
            }
            (Completed, TransactionInput::Timer(TransactionTimer::TimerG)) => {
                let Some(resp) = self.last_response.clone() else {
                    return vec![];
                };
                self.interval = (self.interval * 2).min(self.timers.t2);
                vec![
                    Action::Transmit(resp.into()),
                    Action::Schedule(TransactionTimer::TimerG, self.interval),
                ]
            }
            (Completed, TransactionInput::Timer(TransactionTimer::TimerH)) => {
                self.terminate(TransactionOutcome::Timeout)
            }
            (Completed, TransactionInput::Received(SipMessage::Request(req)))
                if req.method == rsip::Method::Ack =>
            {
                self.state = Confirmed;
                let mut actions = vec![
                    Action::Unschedule(TransactionTimer::TimerG),
                    Action::Unschedule(TransactionTimer::TimerH),
                ];
                let accepted = self
                    .last_response
                    .as_ref()
                    .map(|r| r.status_code.kind() == StatusCodeKind::Successful)
                    .unwrap_or(false);
                if accepted {
                    actions.push(Action::Deliver(req.into()));
                }
                let wait = self.timers.t4;
                actions.extend(self.linger(TransactionTimer::TimerI, wait));
                actions
            }
            (Confirmed, TransactionInput::Timer(TransactionTimer::TimerI)) => {
                self.terminate(TransactionOutcome::Completed)
            }
            _ => vec![],
        }
    }

    fn on_server_non_invite(&mut self, input: TransactionInput) -> Vec<Action> {
        match (self.state, input) {
            (Trying | Proceeding, TransactionInput::Respond(resp)) => {
                self.last_response = Some(resp.clone());
                if resp.status_code.kind() == StatusCodeKind::Provisional {
                    self.state = Proceeding;
                    return vec![Action::Transmit(resp.into())];
                }
                self.state = Completed;
                let mut actions = vec![Action::Transmit(resp.into())];
                let wait = self.timeout_interval();
                actions.extend(self.linger(TransactionTimer::TimerJ, wait));
                actions
            }
            (Proceeding | Completed, TransactionInput::Received(SipMessage::Request(_))) => {
                match &self.last_response {
                    Some(resp) => vec![Action::Transmit(resp.clone().into())],
                    None => vec![],
                }
            }
            (Completed, TransactionInput::Timer(TransactionTimer::TimerJ)) => {
                self.terminate(TransactionOutcome::Completed)
            }
            _ => vec![],
        }
    }
}
