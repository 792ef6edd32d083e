use clap::Parser;
use rsip::prelude::HeadersExt;
use rsip::transport::Transport;
use rsipua::{
    rsip_ext::HeaderList,
    useragent::{AuthInfo, Profile, UserAgentEventReceiver},
    Error, Result, UserAgent, UserAgentBuilder, UserAgentEvent,
};
use std::net::SocketAddr;
use tokio::select;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CALL_REASON_HEADER: &str = "X-Branded-CallReason";

const ANSWER_SDP: &str = "v=0\r\n\
o=rsipua 0 0 IN IP4 127.0.0.1\r\n\
s=rsipua\r\n\
c=IN IP4 127.0.0.1\r\n\
t=0 0\r\n\
m=audio 4000 RTP/AVP 0 8 101\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:101 telephone-event/8000\r\n\
a=sendrecv\r\n";

#[derive(Parser, Debug)]
#[command(author, version, about = "SIP user agent that places one call through a trunk")]
struct Args {
    /// Local address, bound for both UDP and TCP
    #[arg(short, long, default_value = "0.0.0.0:5080")]
    listen: SocketAddr,

    /// Number to call; without it the agent only answers
    #[arg(short, long)]
    target: Option<String>,

    /// Our number, used as the From user
    #[arg(short, long, default_value = "rsipua")]
    caller: String,

    /// Trunk domain the call is sent to
    #[arg(long, default_value = "127.0.0.1")]
    trunk: String,

    /// Digest realm, the trunk domain when not given
    #[arg(long)]
    realm: Option<String>,

    #[arg(long)]
    username: Option<String>,

    #[arg(long, default_value = "")]
    password: String,

    /// Value of the X-Branded-CallReason header
    #[arg(long, default_value = "Whatever reason")]
    call_reason: String,

    /// Answer incoming calls with a canned SDP instead of refusing them
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    auto_answer: bool,

    #[arg(long, default_value = rsipua::VERSION)]
    user_agent: String,
}

async fn handle_events(ua: UserAgent, mut events: UserAgentEventReceiver, auto_answer: bool) {
    while let Some(event) = events.recv().await {
        match event {
            UserAgentEvent::IncomingCall { id, invite } => {
                let from = invite
                    .from_header()
                    .map(|from| from.to_string())
                    .unwrap_or_default();
                info!(%id, %from, "incoming call");
                let r = match auto_answer {
                    true => ua.accept(&id, Some(ANSWER_SDP.as_bytes().to_vec())).await,
                    false => ua.reject(&id, rsip::StatusCode::BusyHere).await,
                };
                if let Err(e) = r {
                    warn!(%id, "failed to answer: {}", e);
                }
            }
            UserAgentEvent::StateChanged(change) => {
                info!(
                    id = %change.id,
                    previous = %change.previous,
                    current = %change.current,
                    "call state changed"
                );
            }
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot watch SIGTERM: {}", e);
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.ok();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .ok();

    let args = Args::parse();

    let ua = UserAgentBuilder::new()
        .with_user_agent(&args.user_agent)
        .build();
    ua.listen(Transport::Udp, args.listen).await?;
    ua.listen(Transport::Tcp, args.listen).await?;
    let events = ua
        .take_event_receiver()
        .ok_or_else(|| Error::Error("event receiver already taken".to_string()))?;

    let serving = ua.clone();
    let serve_loop = tokio::spawn(async move { serving.serve().await });

    if let Some(callee) = &args.target {
        let realm = args.realm.clone().unwrap_or_else(|| args.trunk.clone());
        let auth = AuthInfo {
            realm,
            username: args.username.clone().unwrap_or_default(),
            password: args.password.clone(),
        };
        let profile = Profile::new(
            &format!("{}@{}", args.caller, args.trunk),
            Some(&args.caller),
            Some(auth),
            1800,
        )?;
        let target = format!("sip:{}@{}:5060;transport=udp", callee, args.trunk);
        let headers = HeaderList::new().with(CALL_REASON_HEADER, args.call_reason.as_str());
        match ua.invite(&profile, &target, None, headers).await {
            Ok(id) => info!(%id, %target, "call placed"),
            Err(e) => warn!(%target, "cannot place call: {}", e),
        }
    }

    select! {
        _ = handle_events(ua.clone(), events, args.auto_answer) => {}
        _ = wait_for_signal() => {
            info!("signal received");
        }
    }

    ua.shutdown().await;
    match serve_loop.await {
        Ok(r) => r,
        Err(e) => Err(Error::Error(format!("serve task failed: {}", e))),
    }
}
