//! Drives the auth key exchange over a live connection.
//!
//! The protocol steps themselves live in
//! [`ferrogram_mtproto::authentication`]; this module moves their messages
//! over the wire as plaintext frames and runs the expensive math (pq
//! factorization, RSA, modular exponentiation) on the [`CryptoPool`].

use std::sync::Arc;
use std::time::Duration;

use ferrogram_mtproto::MessageClock;
use ferrogram_mtproto::authentication::{self, Finished, Outcome, TrustedKeys};
use ferrogram_mtproto::message;
use ferrogram_tl::{Deserializable, Serializable, enums, types};

use crate::blocking::CryptoPool;
use crate::errors::InvocationError;
use crate::transport::{Connection, Connector, TransportKind};

/// Whole-handshake attempts when the network, not the crypto, fails.
pub const HANDSHAKE_ATTEMPTS: u32 = 3;

/// Where and how to run a handshake.
pub struct HandshakeTarget<'a> {
    pub addr: &'a str,
    pub transport: &'a TransportKind,
    /// The DC id written into `p_q_inner_data_dc` (test DCs are offset by
    /// 10000, media DCs negated).
    pub wire_dc_id: i32,
    pub step_timeout: Duration,
}

/// Run the handshake on `conn`. Cryptographic failures surface as
/// [`InvocationError::Handshake`].
pub async fn negotiate(
    conn: &mut Connection,
    wire_dc_id: i32,
    trusted: &Arc<TrustedKeys>,
    pool: &CryptoPool,
    step_timeout: Duration,
) -> Result<Finished, InvocationError> {
    let mut clock = MessageClock::new(0);

    let (req, step1) = authentication::step1()?;
    let res_pq: types::ResPq = exchange(conn, &mut clock, &req, step_timeout).await?;

    let keys = Arc::clone(trusted);
    let (req, step2) = pool.run(move || authentication::step2(step1, res_pq, wire_dc_id, &keys)).await??;
    let params: enums::ServerDhParams = exchange(conn, &mut clock, &req, step_timeout).await?;

    let (mut req, mut step3) = pool.run(move || authentication::step3(step2, params)).await??;
    loop {
        let answer: enums::SetClientDhParamsAnswer = exchange(conn, &mut clock, &req, step_timeout).await?;
        match pool.run(move || authentication::finish(step3, answer)).await?? {
            Outcome::Done(finished) => return Ok(finished),
            Outcome::Retry(next_req, next_step) => {
                tracing::debug!("[ferrogram] dh_gen_retry, sending new client DH params");
                req = next_req;
                step3 = next_step;
            }
        }
    }
}

/// Open a fresh connection and negotiate a key over it, retrying the whole
/// exchange up to [`HANDSHAKE_ATTEMPTS`] times on transport faults.
///
/// Returns the connection, ready for encrypted traffic, with the result.
pub async fn connect_and_negotiate(
    connector: &Arc<dyn Connector>,
    target: HandshakeTarget<'_>,
    trusted: &Arc<TrustedKeys>,
    pool: &CryptoPool,
) -> Result<(Connection, Finished), InvocationError> {
    let obfuscation_dc = target.wire_dc_id as i16;
    let mut attempt = 1;
    loop {
        let result = async {
            let mut conn =
                Connection::open(connector, target.addr, target.transport, obfuscation_dc, target.step_timeout)
                    .await?;
            let finished = negotiate(&mut conn, target.wire_dc_id, trusted, pool, target.step_timeout).await?;
            Ok::<_, InvocationError>((conn, finished))
        }
        .await;

        match result {
            Ok((conn, finished)) => {
                tracing::info!(
                    "[ferrogram] auth key {} negotiated with {} (time offset {}s)",
                    finished.auth_key.fingerprint(),
                    target.addr,
                    finished.time_offset
                );
                return Ok((conn, finished));
            }
            Err(e) if e.is_transient() && attempt < HANDSHAKE_ATTEMPTS => {
                tracing::warn!("[ferrogram] handshake with {} failed ({e}), attempt {attempt}", target.addr);
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!("[ferrogram] handshake with {} failed: {e}", target.addr);
                return Err(e);
            }
        }
    }
}

async fn exchange<R: Serializable, T: Deserializable>(
    conn: &mut Connection,
    clock: &mut MessageClock,
    request: &R,
    timeout: Duration,
) -> Result<T, InvocationError> {
    let frame = message::plaintext(clock.next_msg_id(), &request.to_bytes());
    conn.send(&frame).await?;
    let reply = tokio::time::timeout(timeout, conn.recv()).await.map_err(|_| InvocationError::Timeout)??;
    let (_, body) = message::parse_plaintext(&reply).map_err(|e| InvocationError::Deserialize(e.to_string()))?;
    Ok(T::from_bytes(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrogram_mtproto::transport::{Framing, Intermediate};
    use ferrogram_tl::functions;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Answers `req_pq_multi` with a key fingerprint nobody trusts.
    async fn untrusted_server(mut stream: tokio::io::DuplexStream) {
        let mut tag = [0u8; 4];
        stream.read_exact(&mut tag).await.unwrap();
        let mut framing = Intermediate::new();
        let mut buf = [0u8; 1024];
        let frame = loop {
            if let Some(f) = framing.next_frame().unwrap() {
                break f;
            }
            let n = stream.read(&mut buf).await.unwrap();
            framing.feed(&buf[..n]);
        };
        let (_, body) = message::parse_plaintext(&frame).unwrap();
        let req = functions::ReqPqMulti::from_bytes(body).unwrap();

        let res = types::ResPq {
            nonce: req.nonce,
            server_nonce: [7; 16],
            pq: 0x17ED48941A08F981u64.to_be_bytes().to_vec(),
            server_public_key_fingerprints: vec![0x1234],
        };
        let mut out = Vec::new();
        framing.encode(&message::plaintext(1 << 32 | 1, &res.to_bytes()), &mut out);
        stream.write_all(&out).await.unwrap();
    }

    #[tokio::test]
    async fn untrusted_server_key_fails_the_handshake() {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(untrusted_server(server));
        let mut conn = Connection::over(Box::new(client), Box::new(Intermediate::new())).await.unwrap();

        let err = negotiate(&mut conn, 2, &Arc::new(TrustedKeys::builtin()), &CryptoPool::new(1), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, InvocationError::Handshake(authentication::Error::UntrustedServer { fingerprints }) if fingerprints == &[0x1234]),
            "{err:?}"
        );
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let (client, _server) = tokio::io::duplex(4096);
        let mut conn = Connection::over(Box::new(client), Box::new(Intermediate::new())).await.unwrap();
        let err = negotiate(&mut conn, 2, &Arc::new(TrustedKeys::builtin()), &CryptoPool::new(1), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::Timeout));
    }
}
