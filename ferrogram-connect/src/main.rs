//! Negotiates an auth key with a DC and makes one encrypted call.
//!
//! 1. Connect over the Intermediate transport (test DC2 by default)
//! 2. Run the three-step DH exchange, math on the blocking pool
//! 3. Send `help.getConfig` in an MTProto 2.0 encrypted message
//! 4. Print the DC list from the answer
//!
//! # Run
//! ```text
//! RUST_LOG=debug cargo run -p ferrogram-connect -- [--prod] [DC]
//! ```

use std::sync::Arc;
use std::time::Duration;

use ferrogram_client::transport::{Connection, Connector, TcpConnector, TransportKind};
use ferrogram_client::{CryptoPool, HandshakeTarget, connect_and_negotiate};
use ferrogram_mtproto::authentication::TrustedKeys;
use ferrogram_mtproto::encrypted::seal;
use ferrogram_mtproto::service::{self, Inbound, RpcOutcome};
use ferrogram_mtproto::EncryptedSession;
use ferrogram_tl::{Deserializable, functions, types};
use tracing_subscriber::EnvFilter;

const PROD_DCS: &[(i32, &str)] = &[
    (1, "149.154.175.53:443"),
    (2, "149.154.167.51:443"),
    (3, "149.154.175.100:443"),
    (4, "149.154.167.91:443"),
    (5, "91.108.56.130:443"),
];
const TEST_DCS: &[(i32, &str)] = &[(1, "149.154.175.10:80"), (2, "149.154.167.40:80"), (3, "149.154.175.117:80")];

const STEP_TIMEOUT: Duration = Duration::from_secs(15);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

struct Args {
    prod: bool,
    dc_id: i32,
}

fn parse_args() -> Result<Args, BoxError> {
    let mut args = Args { prod: false, dc_id: 2 };
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--prod" => args.prod = true,
            n => args.dc_id = n.parse().map_err(|_| format!("not a DC number: {n}"))?,
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), BoxError> {
    let args = parse_args()?;
    let table = if args.prod { PROD_DCS } else { TEST_DCS };
    let addr = table
        .iter()
        .find(|(id, _)| *id == args.dc_id)
        .map(|(_, addr)| *addr)
        .ok_or_else(|| format!("unknown DC{}", args.dc_id))?;
    let wire_dc_id = if args.prod { args.dc_id } else { 10_000 + args.dc_id };

    // ── Auth key ─────────────────────────────────────────────────────────────
    tracing::info!("negotiating an auth key with DC{} at {addr}", args.dc_id);
    let connector: Arc<dyn Connector> = Arc::new(TcpConnector::new(None));
    let transport = TransportKind::default();
    let target = HandshakeTarget { addr, transport: &transport, wire_dc_id, step_timeout: STEP_TIMEOUT };
    let trusted = Arc::new(TrustedKeys::builtin());
    let crypto = CryptoPool::new(2);
    let (mut conn, finished) = connect_and_negotiate(&connector, target, &trusted, &crypto).await?;

    println!("auth key   {:#018x}", finished.auth_key.fingerprint());
    println!("first salt {:#018x}", finished.first_salt);
    println!("time skew  {}s", finished.time_offset);

    // ── Encrypted call ───────────────────────────────────────────────────────
    let mut session = EncryptedSession::new(Arc::new(finished.auth_key), finished.first_salt, finished.time_offset)?;
    let config = get_config(&mut conn, &mut session).await?;

    println!("DC{} config, {} options:", config.this_dc, config.dc_options.len());
    for dc in &config.dc_options {
        let mut flags = Vec::new();
        if dc.ipv6 {
            flags.push("ipv6");
        }
        if dc.media_only {
            flags.push("media");
        }
        if dc.cdn {
            flags.push("cdn");
        }
        println!("  DC{:<3} {}:{} {}", dc.id, dc.ip_address, dc.port, flags.join(","));
    }

    conn.shutdown().await;
    Ok(())
}

/// Send `help.getConfig` and read frames until its result arrives. A
/// `bad_server_salt` answer is followed by one resend under the new salt.
async fn get_config(conn: &mut Connection, session: &mut EncryptedSession) -> Result<types::Config, BoxError> {
    let mut resent = false;
    let mut request = session.new_request(&functions::help::GetConfig {});
    send(conn, session, &request).await?;

    loop {
        let mut frame = tokio::time::timeout(STEP_TIMEOUT, conn.recv()).await.map_err(|_| "no answer")??;
        let msg = session.unpack(&mut frame)?;
        let messages = match service::classify(&msg.body)? {
            Inbound::Container(inner) => {
                inner.iter().map(|m| service::classify(&m.body)).collect::<Result<Vec<_>, _>>()?
            }
            other => vec![other],
        };

        for inbound in messages {
            match inbound {
                Inbound::RpcResult { req_msg_id, outcome } if req_msg_id == request.msg_id => {
                    return match outcome {
                        RpcOutcome::Ok(body) => Ok(types::Config::from_bytes(&body)?),
                        RpcOutcome::Err(e) => Err(format!("rpc error {}: {}", e.error_code, e.error_message).into()),
                        RpcOutcome::Dropped => Err("answer dropped by the server".into()),
                    };
                }
                Inbound::BadServerSalt(bad) if !resent => {
                    tracing::info!("server salt changed, sending again");
                    session.salts_mut().set_current(bad.new_server_salt);
                    request = session.new_request(&functions::help::GetConfig {});
                    send(conn, session, &request).await?;
                    resent = true;
                }
                Inbound::NewSessionCreated(created) => {
                    tracing::debug!("server session created, first msg_id {}", created.first_msg_id);
                }
                other => tracing::debug!("ignoring {other:?}"),
            }
        }
    }
}

async fn send(
    conn: &mut Connection,
    session: &mut EncryptedSession,
    request: &ferrogram_mtproto::OutgoingMessage,
) -> Result<(), BoxError> {
    let packed = session.pack(std::slice::from_ref(request));
    let frame = seal(&packed.plaintext, session.auth_key())?;
    conn.send(&frame).await?;
    Ok(())
}
