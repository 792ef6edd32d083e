use super::{local_request, peer_request, peer_response};
use crate::transaction::fsm::{
    TransactionAction, TransactionFsm, TransactionInput, TransactionOutcome, TransactionState,
    TransactionTimer, TransactionTimers, TransactionType,
};
use rsip::StatusCode;
use std::time::Duration;

fn timers() -> TransactionTimers {
    TransactionTimers {
        t1: Duration::from_millis(500),
        t2: Duration::from_secs(4),
        t4: Duration::from_secs(5),
    }
}

fn scheduled(actions: &[TransactionAction], timer: TransactionTimer) -> Option<Duration> {
    actions.iter().find_map(|a| match a {
        TransactionAction::Schedule(t, d) if *t == timer => Some(*d),
        _ => None,
    })
}

fn transmits(actions: &[TransactionAction]) -> usize {
    actions
        .iter()
        .filter(|a| matches!(a, TransactionAction::Transmit(_)))
        .count()
}

fn terminated(actions: &[TransactionAction]) -> Option<TransactionOutcome> {
    actions.iter().find_map(|a| match a {
        TransactionAction::Terminate(outcome) => Some(*outcome),
        _ => None,
    })
}

#[test]
fn test_client_invite_timer_a_doubles_without_cap() {
    let invite = local_request(rsip::Method::Invite);
    let mut fsm = TransactionFsm::new(TransactionType::ClientInvite, false, timers());
    let actions = fsm.on_event(TransactionInput::Send(invite));
    assert_eq!(transmits(&actions), 1);
    assert_eq!(
        scheduled(&actions, TransactionTimer::TimerA),
        Some(Duration::from_millis(500))
    );
    assert_eq!(
        scheduled(&actions, TransactionTimer::TimerB),
        Some(Duration::from_secs(32))
    );

    let mut expected = Duration::from_millis(500);
    for _ in 0..5 {
        expected *= 2;
        let actions = fsm.on_event(TransactionInput::Timer(TransactionTimer::TimerA));
        assert_eq!(transmits(&actions), 1);
        assert_eq!(scheduled(&actions, TransactionTimer::TimerA), Some(expected));
    }
    // 16s, well past T2
    assert!(expected > timers().t2);

    let actions = fsm.on_event(TransactionInput::Timer(TransactionTimer::TimerB));
    assert_eq!(terminated(&actions), Some(TransactionOutcome::Timeout));
    assert_eq!(fsm.state, TransactionState::Terminated);
    assert!(fsm
        .on_event(TransactionInput::Timer(TransactionTimer::TimerA))
        .is_empty());
}

#[test]
fn test_client_invite_reliable_skips_timer_a() {
    let invite = local_request(rsip::Method::Invite);
    let mut fsm = TransactionFsm::new(TransactionType::ClientInvite, true, timers());
    let actions = fsm.on_event(TransactionInput::Send(invite.clone()));
    assert_eq!(scheduled(&actions, TransactionTimer::TimerA), None);
    assert!(scheduled(&actions, TransactionTimer::TimerB).is_some());

    let busy = peer_response(&invite, StatusCode::BusyHere);
    let actions = fsm.on_event(TransactionInput::Received(busy.into()));
    assert!(actions
        .iter()
        .any(|a| matches!(a, TransactionAction::Acknowledge(_))));
    // Timer D is zero over a reliable transport
    assert_eq!(terminated(&actions), Some(TransactionOutcome::Completed));
}

#[test]
fn test_client_invite_non2xx_absorbs_retransmissions() {
    let invite = local_request(rsip::Method::Invite);
    let mut fsm = TransactionFsm::new(TransactionType::ClientInvite, false, timers());
    fsm.on_event(TransactionInput::Send(invite.clone()));

    let busy = peer_response(&invite, StatusCode::BusyHere);
    let actions = fsm.on_event(TransactionInput::Received(busy.clone().into()));
    assert_eq!(fsm.state, TransactionState::Completed);
    assert_eq!(
        actions
            .iter()
            .filter(|a| matches!(a, TransactionAction::Deliver(_)))
            .count(),
        1
    );
    assert_eq!(
        scheduled(&actions, TransactionTimer::TimerD),
        Some(Duration::from_secs(32))
    );

    // the retransmitted final is ACKed again and not delivered
    let actions = fsm.on_event(TransactionInput::Received(busy.into()));
    assert!(matches!(
        actions.as_slice(),
        [TransactionAction::Acknowledge(_)]
    ));

    let actions = fsm.on_event(TransactionInput::Timer(TransactionTimer::TimerD));
    assert_eq!(terminated(&actions), Some(TransactionOutcome::Completed));
}

#[test]
fn test_client_invite_accepted_delivers_every_2xx() {
    let invite = local_request(rsip::Method::Invite);
    let mut fsm = TransactionFsm::new(TransactionType::ClientInvite, false, timers());
    fsm.on_event(TransactionInput::Send(invite.clone()));

    let ringing = peer_response(&invite, StatusCode::Ringing);
    fsm.on_event(TransactionInput::Received(ringing.into()));
    assert_eq!(fsm.state, TransactionState::Proceeding);

    let ok = peer_response(&invite, StatusCode::OK);
    let actions = fsm.on_event(TransactionInput::Received(ok.clone().into()));
    assert_eq!(fsm.state, TransactionState::Accepted);
    assert!(scheduled(&actions, TransactionTimer::TimerM).is_some());
    assert!(!actions
        .iter()
        .any(|a| matches!(a, TransactionAction::Acknowledge(_))));

    let actions = fsm.on_event(TransactionInput::Received(ok.into()));
    assert!(matches!(actions.as_slice(), [TransactionAction::Deliver(_)]));

    let actions = fsm.on_event(TransactionInput::Timer(TransactionTimer::TimerM));
    assert_eq!(terminated(&actions), Some(TransactionOutcome::Completed));
}

#[test]
fn test_client_invite_cancel_waits_for_provisional() {
    let invite = local_request(rsip::Method::Invite);
    let mut fsm = TransactionFsm::new(TransactionType::ClientInvite, false, timers());
    fsm.on_event(TransactionInput::Send(invite.clone()));

    assert!(fsm.can_cancel());
    assert!(fsm.on_event(TransactionInput::Cancel).is_empty());
    assert!(!fsm.can_cancel());

    let trying = peer_response(&invite, StatusCode::Trying);
    let actions = fsm.on_event(TransactionInput::Received(trying.into()));
    assert!(actions
        .iter()
        .any(|a| matches!(a, TransactionAction::SendCancel)));
    assert!(scheduled(&actions, TransactionTimer::TimerB).is_some());

    // a second provisional does not send another CANCEL
    let ringing = peer_response(&invite, StatusCode::Ringing);
    let actions = fsm.on_event(TransactionInput::Received(ringing.into()));
    assert!(!actions
        .iter()
        .any(|a| matches!(a, TransactionAction::SendCancel)));
}

#[test]
fn test_client_non_invite_timer_e_caps_at_t2() {
    let options = local_request(rsip::Method::Options);
    let mut fsm = TransactionFsm::new(TransactionType::ClientNonInvite, false, timers());
    let actions = fsm.on_event(TransactionInput::Send(options.clone()));
    assert_eq!(
        scheduled(&actions, TransactionTimer::TimerE),
        Some(Duration::from_millis(500))
    );
    assert!(scheduled(&actions, TransactionTimer::TimerF).is_some());

    let mut last = Duration::ZERO;
    for _ in 0..6 {
        let actions = fsm.on_event(TransactionInput::Timer(TransactionTimer::TimerE));
        last = scheduled(&actions, TransactionTimer::TimerE).expect("timer E");
    }
    assert_eq!(last, timers().t2);

    let trying = peer_response(&options, StatusCode::Trying);
    fsm.on_event(TransactionInput::Received(trying.into()));
    assert_eq!(fsm.state, TransactionState::Proceeding);

    let ok = peer_response(&options, StatusCode::OK);
    let actions = fsm.on_event(TransactionInput::Received(ok.into()));
    assert_eq!(fsm.state, TransactionState::Completed);
    assert_eq!(
        scheduled(&actions, TransactionTimer::TimerK),
        Some(timers().t4)
    );
}

#[test]
fn test_client_non_invite_timeout() {
    let options = local_request(rsip::Method::Options);
    let mut fsm = TransactionFsm::new(TransactionType::ClientNonInvite, true, timers());
    let actions = fsm.on_event(TransactionInput::Send(options));
    assert_eq!(scheduled(&actions, TransactionTimer::TimerE), None);
    let actions = fsm.on_event(TransactionInput::Timer(TransactionTimer::TimerF));
    assert_eq!(terminated(&actions), Some(TransactionOutcome::Timeout));
}

#[test]
fn test_server_invite_confirmed_by_ack() {
    let invite = peer_request(rsip::Method::Invite, "fsm-invite", 1);
    let mut fsm = TransactionFsm::new(TransactionType::ServerInvite, false, timers());
    assert_eq!(fsm.state, TransactionState::Proceeding);
    assert!(fsm.can_respond());

    let ringing = peer_response(&invite, StatusCode::Ringing);
    let actions = fsm.on_event(TransactionInput::Respond(ringing));
    assert_eq!(transmits(&actions), 1);
    assert_eq!(fsm.state, TransactionState::Proceeding);

    // retransmitted INVITE replays the last provisional
    let actions = fsm.on_event(TransactionInput::Received(invite.clone().into()));
    assert_eq!(transmits(&actions), 1);

    let busy = peer_response(&invite, StatusCode::BusyHere);
    let actions = fsm.on_event(TransactionInput::Respond(busy));
    assert_eq!(fsm.state, TransactionState::Completed);
    assert!(!fsm.can_respond());
    assert_eq!(
        scheduled(&actions, TransactionTimer::TimerG),
        Some(timers().t1)
    );
    assert_eq!(
        scheduled(&actions, TransactionTimer::TimerH),
        Some(Duration::from_secs(32))
    );

    let actions = fsm.on_event(TransactionInput::Timer(TransactionTimer::TimerG));
    assert_eq!(transmits(&actions), 1);
    assert_eq!(
        scheduled(&actions, TransactionTimer::TimerG),
        Some(timers().t1 * 2)
    );

    let mut ack = invite.clone();
    ack.method = rsip::Method::Ack;
    let actions = fsm.on_event(TransactionInput::Received(ack.into()));
    assert_eq!(fsm.state, TransactionState::Confirmed);
    // the ACK of a non-2xx stays inside the transaction
    assert!(!actions
        .iter()
        .any(|a| matches!(a, TransactionAction::Deliver(_))));
    assert_eq!(
        scheduled(&actions, TransactionTimer::TimerI),
        Some(timers().t4)
    );
}

#[test]
fn test_server_invite_timer_h_times_out() {
    let invite = peer_request(rsip::Method::Invite, "fsm-timer-h", 1);
    let mut fsm = TransactionFsm::new(TransactionType::ServerInvite, true, timers());
    let actions = fsm.on_event(TransactionInput::Respond(peer_response(
        &invite,
        StatusCode::OK,
    )));
    assert_eq!(scheduled(&actions, TransactionTimer::TimerG), None);
    let actions = fsm.on_event(TransactionInput::Timer(TransactionTimer::TimerH));
    assert_eq!(terminated(&actions), Some(TransactionOutcome::Timeout));
}

#[test]
fn test_server_invite_delivers_cancel_until_final() {
    let invite = peer_request(rsip::Method::Invite, "fsm-cancel", 1);
    let mut cancel = invite.clone();
    cancel.method = rsip::Method::Cancel;
    let mut fsm = TransactionFsm::new(TransactionType::ServerInvite, false, timers());

    let actions = fsm.on_event(TransactionInput::Received(cancel.clone().into()));
    assert!(matches!(actions.as_slice(), [TransactionAction::Deliver(_)]));

    fsm.on_event(TransactionInput::Respond(peer_response(
        &invite,
        StatusCode::RequestTerminated,
    )));
    assert!(fsm
        .on_event(TransactionInput::Received(cancel.into()))
        .is_empty());
}

#[test]
fn test_server_non_invite_replays_final() {
    let options = peer_request(rsip::Method::Options, "fsm-options", 1);
    let mut fsm = TransactionFsm::new(TransactionType::ServerNonInvite, false, timers());
    assert_eq!(fsm.state, TransactionState::Trying);

    // nothing to replay yet
    assert!(fsm
        .on_event(TransactionInput::Received(options.clone().into()))
        .is_empty());

    let actions = fsm.on_event(TransactionInput::Respond(peer_response(
        &options,
        StatusCode::OK,
    )));
    assert_eq!(fsm.state, TransactionState::Completed);
    assert_eq!(
        scheduled(&actions, TransactionTimer::TimerJ),
        Some(Duration::from_secs(32))
    );

    let actions = fsm.on_event(TransactionInput::Received(options.into()));
    assert_eq!(transmits(&actions), 1);

    let actions = fsm.on_event(TransactionInput::Timer(TransactionTimer::TimerJ));
    assert_eq!(terminated(&actions), Some(TransactionOutcome::Completed));
}

#[test]
fn test_transport_error_terminates() {
    let mut fsm = TransactionFsm::new(TransactionType::ServerNonInvite, false, timers());
    let actions = fsm.on_event(TransactionInput::TransportError);
    assert_eq!(terminated(&actions), Some(TransactionOutcome::TransportFailure));
    assert_eq!(fsm.state, TransactionState::Terminated);
    assert!(fsm.on_event(TransactionInput::TransportError).is_empty());
}
