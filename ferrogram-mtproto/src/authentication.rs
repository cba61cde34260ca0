//! Sans-IO MTProto authorization key generation.
//!
//! # Flow
//!
//! ```text
//! let (req, s1) = authentication::step1()?;
//! // send req, receive resp
//! let (req, s2) = authentication::step2(s1, resp, dc_id, &trusted)?;
//! // send req, receive resp
//! let (req, s3) = authentication::step3(s2, resp)?;
//! // send req, receive resp
//! match authentication::finish(s3, resp)? {
//!     Outcome::Done(done) => { /* done.auth_key is ready */ }
//!     Outcome::Retry(req, s3) => { /* send req again and finish(s3, ..) */ }
//! }
//! ```
//!
//! Every step checks the echoed nonces and hashes and fails the whole
//! exchange on the first mismatch.

use std::time::{SystemTime, UNIX_EPOCH};

use ferrogram_crypto::{AuthKey, RandomError, aes, dh, factorize, generate_key_data_from_nonce, random_array, rsa, sha1};
use ferrogram_tl::{Cursor, Deserializable, Serializable, enums, functions, types};
use num_bigint::BigUint;

/// Server-requested `dh_gen_retry`s tolerated before giving up.
pub const MAX_DH_RETRIES: u32 = 5;

// ─── Error ────────────────────────────────────────────────────────────────────

/// Errors that can occur during auth key generation.
///
/// All of them are fatal to the exchange; none is recovered by retrying
/// against the same server.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("nonce mismatch")]
    InvalidNonce,
    #[error("server_nonce mismatch")]
    InvalidServerNonce,
    #[error("pq has {size} bytes, expected 8")]
    InvalidPqSize { size: usize },
    #[error("pq {pq} could not be factorized")]
    Unfactorizable { pq: u64 },
    #[error("no trusted key matches fingerprints {fingerprints:?}")]
    UntrustedServer { fingerprints: Vec<i64> },
    #[error("p_q_inner_data is too large for RSA_PAD")]
    PayloadTooLarge,
    #[error("server refused the DH parameters")]
    DhParamsFail,
    #[error("encrypted answer of {len} bytes is not 16-byte aligned")]
    EncryptedResponseNotPadded { len: usize },
    #[error("server_DH_inner_data could not be decoded: {0}")]
    InvalidDhInnerData(ferrogram_tl::deserialize::Error),
    #[error("answer hash mismatch")]
    InvalidAnswerHash,
    #[error("invalid DH parameters: {0}")]
    InvalidDhParams(#[from] dh::DhParamError),
    #[error("new_nonce hash mismatch")]
    InvalidNewNonceHash,
    #[error("server kept answering dh_gen_retry")]
    DhGenRetry,
    #[error("server answered dh_gen_fail")]
    DhGenFail,
    #[error(transparent)]
    Random(#[from] RandomError),
}

// ─── Trusted keys ─────────────────────────────────────────────────────────────

/// The RSA keys a server must prove it holds.
#[derive(Clone, Debug)]
pub struct TrustedKeys {
    keys: Vec<rsa::Key>,
}

impl TrustedKeys {
    pub fn new(keys: Vec<rsa::Key>) -> Self {
        Self { keys }
    }

    /// The production and test DC keys.
    #[allow(clippy::unreadable_literal)]
    pub fn builtin() -> Self {
        let moduli = [
            // Production DCs (fingerprint -3414540481677951611)
            "29379598170669337022986177149456128565388431120058863768162556424047512191330847455146576344487764408661701890505066208632169112269581063774293102577308490531282748465986139880977280302242772832972539403531316010870401287642763009136156734339538042419388722777357134487746169093539093850251243897188928735903389451772730245253062963384108812842079887538976360465290946139638691491496062099570836476454855996319192747663615955633778034897140982517446405334423701359108810182097749467210509584293428076654573384828809574217079944388301239431309115013843331317877374435868468779972014486325557807783825502498215169806323",
            // Test DCs (fingerprint -5595554452916591101)
            "25342889448840415564971689590713473206898847759084779052582026594546022463853940585885215951168491965708222649399180603818074200620463776135424884632162512403163793083921641631564740959529419359595852941166848940585952337613333022396096584117954892216031229237302943701877588456738335398602461675225081791820393153757504952636234951323237820036543581047826906120927972487366805292115792231423684261262330394324750785450942589751755390156647751460719351439969059949569615302809050721500330239005077889855323917509948255722081644689442127297605422579707142646660768825302832201908302295573257427896031830742328565032949",
        ];
        Self { keys: moduli.iter().filter_map(|n| rsa::Key::new(n, "65537")).collect() }
    }

    /// The first advertised fingerprint we hold a key for.
    pub fn find(&self, fingerprints: &[i64]) -> Option<(i64, &rsa::Key)> {
        fingerprints
            .iter()
            .find_map(|&fp| self.keys.iter().find(|k| k.fingerprint() == fp).map(|k| (fp, k)))
    }
}

impl Default for TrustedKeys {
    fn default() -> Self { Self::builtin() }
}

// ─── Step state ──────────────────────────────────────────────────────────────

/// State after step 1.
#[derive(Debug)]
pub struct Step1 {
    nonce: [u8; 16],
}

/// State after step 2.
#[derive(Debug)]
pub struct Step2 {
    nonce: [u8; 16],
    server_nonce: [u8; 16],
    new_nonce: [u8; 32],
}

/// State after step 3, enough to verify the answer or build a retry.
#[derive(Debug)]
pub struct Step3 {
    nonce: [u8; 16],
    server_nonce: [u8; 16],
    new_nonce: [u8; 32],
    dh_prime: BigUint,
    g: BigUint,
    g_a: BigUint,
    key: [u8; 32],
    iv: [u8; 32],
    auth_key: AuthKey,
    time_offset: i32,
    retries: u32,
}

/// The final output of a successful auth key handshake.
#[derive(Clone, Debug, PartialEq)]
pub struct Finished {
    pub auth_key: AuthKey,
    /// Seconds to add to local time to get server time.
    pub time_offset: i32,
    /// Initial server salt: `new_nonce[..8] ^ server_nonce[..8]`.
    pub first_salt: i64,
}

/// What [`finish`] produced.
#[derive(Debug)]
pub enum Outcome {
    Done(Finished),
    /// The server asked for another `g_b`; send the request and call
    /// [`finish`] again with the new state.
    Retry(functions::SetClientDhParams, Step3),
}

// ─── Step 1: req_pq_multi ────────────────────────────────────────────────────

/// Generate a `req_pq_multi` request. Returns the request + opaque state.
pub fn step1() -> Result<(functions::ReqPqMulti, Step1), Error> {
    Ok(do_step1(&random_array::<16>()?))
}

pub fn do_step1(random: &[u8; 16]) -> (functions::ReqPqMulti, Step1) {
    let nonce = *random;
    (functions::ReqPqMulti { nonce }, Step1 { nonce })
}

// ─── Step 2: req_DH_params ───────────────────────────────────────────────────

/// Process `resPQ` and generate `req_DH_params`.
///
/// `dc_id` goes into `p_q_inner_data_dc` as the server expects it
/// (offset by 10000 for test DCs, negated for media DCs).
pub fn step2(
    data: Step1,
    response: types::ResPq,
    dc_id: i32,
    trusted: &TrustedKeys,
) -> Result<(functions::ReqDhParams, Step2), Error> {
    do_step2(data, response, dc_id, trusted, &random_array::<256>()?)
}

pub fn do_step2(
    data: Step1,
    response: types::ResPq,
    dc_id: i32,
    trusted: &TrustedKeys,
    random: &[u8; 256],
) -> Result<(functions::ReqDhParams, Step2), Error> {
    let Step1 { nonce } = data;
    check_nonce(&response.nonce, &nonce)?;

    let pq_bytes: [u8; 8] = response
        .pq
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidPqSize { size: response.pq.len() })?;
    let pq = u64::from_be_bytes(pq_bytes);
    let (p, q) = factorize(pq).ok_or(Error::Unfactorizable { pq })?;

    let (fingerprint, key) = trusted
        .find(&response.server_public_key_fingerprints)
        .ok_or_else(|| Error::UntrustedServer { fingerprints: response.server_public_key_fingerprints.clone() })?;

    let mut new_nonce = [0u8; 32];
    new_nonce.copy_from_slice(&random[..32]);
    let mut rsa_random = [0u8; 224];
    rsa_random.copy_from_slice(&random[32..]);

    let p_bytes = trim_be(p);
    let q_bytes = trim_be(q);

    let inner = types::PQInnerDataDc {
        pq: pq_bytes.to_vec(),
        p: p_bytes.clone(),
        q: q_bytes.clone(),
        nonce,
        server_nonce: response.server_nonce,
        new_nonce,
        dc: dc_id,
    }
    .to_bytes();

    let encrypted_data = rsa::encrypt_hashed(&inner, key, &rsa_random).ok_or(Error::PayloadTooLarge)?;
    log::debug!("pq factorized, using server key {fingerprint}");

    Ok((
        functions::ReqDhParams {
            nonce,
            server_nonce: response.server_nonce,
            p: p_bytes,
            q: q_bytes,
            public_key_fingerprint: fingerprint,
            encrypted_data,
        },
        Step2 { nonce, server_nonce: response.server_nonce, new_nonce },
    ))
}

fn trim_be(v: u64) -> Vec<u8> {
    let b = v.to_be_bytes();
    let skip = b.iter().position(|&x| x != 0).unwrap_or(7);
    b[skip..].to_vec()
}

// ─── Step 3: set_client_DH_params ────────────────────────────────────────────

/// Process `Server_DH_Params` and generate `set_client_DH_params`.
pub fn step3(
    data: Step2,
    response: enums::ServerDhParams,
) -> Result<(functions::SetClientDhParams, Step3), Error> {
    do_step3(data, response, &random_array::<272>()?, unix_now())
}

pub fn do_step3(
    data: Step2,
    response: enums::ServerDhParams,
    random: &[u8; 272],
    now: i32,
) -> Result<(functions::SetClientDhParams, Step3), Error> {
    let Step2 { nonce, server_nonce, new_nonce } = data;

    let mut server_dh_ok = match response {
        enums::ServerDhParams::Fail(f) => {
            check_nonce(&f.nonce, &nonce)?;
            check_server_nonce(&f.server_nonce, &server_nonce)?;
            let digest = sha1!(new_nonce);
            if f.new_nonce_hash != digest[4..] {
                return Err(Error::InvalidNewNonceHash);
            }
            return Err(Error::DhParamsFail);
        }
        enums::ServerDhParams::Ok(x) => x,
    };

    check_nonce(&server_dh_ok.nonce, &nonce)?;
    check_server_nonce(&server_dh_ok.server_nonce, &server_nonce)?;

    let len = server_dh_ok.encrypted_answer.len();
    if len % 16 != 0 || len < 32 {
        return Err(Error::EncryptedResponseNotPadded { len });
    }

    let (key, iv) = generate_key_data_from_nonce(&server_nonce, &new_nonce);
    aes::ige_decrypt(&mut server_dh_ok.encrypted_answer, &key, &iv);
    let plain = server_dh_ok.encrypted_answer;

    let mut cursor = Cursor::from_slice(&plain[20..]);
    let inner = types::ServerDhInnerData::deserialize(&mut cursor).map_err(Error::InvalidDhInnerData)?;
    let answer_len = cursor.pos();
    if sha1!(&plain[20..20 + answer_len]) != plain[..20] || plain.len() - 20 - answer_len >= 16 {
        return Err(Error::InvalidAnswerHash);
    }

    check_nonce(&inner.nonce, &nonce)?;
    check_server_nonce(&inner.server_nonce, &server_nonce)?;

    let dh_prime = BigUint::from_bytes_be(&inner.dh_prime);
    dh::check_prime_and_generator(&dh_prime, inner.g)?;
    let g_a = BigUint::from_bytes_be(&inner.g_a);
    dh::check_public_value(&g_a, &dh_prime, "g_a")?;

    let common = Step3 {
        nonce,
        server_nonce,
        new_nonce,
        g: BigUint::from(inner.g as u32),
        dh_prime,
        g_a,
        key,
        iv,
        auth_key: AuthKey::from_bytes([0; 256]),
        time_offset: inner.server_time.wrapping_sub(now),
        retries: 0,
    };
    client_dh_params(common, 0, random)
}

/// Pick `b`, compute `g_b` and the auth key, and encrypt `client_DH_inner_data`.
fn client_dh_params(
    mut state: Step3,
    retry_id: i64,
    random: &[u8; 272],
) -> Result<(functions::SetClientDhParams, Step3), Error> {
    let b = BigUint::from_bytes_be(&random[..256]);
    let g_b = state.g.modpow(&b, &state.dh_prime);
    dh::check_public_value(&g_b, &state.dh_prime, "g_b")?;
    let gab = state.g_a.modpow(&b, &state.dh_prime);

    let client_dh_inner = types::ClientDhInnerData {
        nonce: state.nonce,
        server_nonce: state.server_nonce,
        retry_id,
        g_b: g_b.to_bytes_be(),
    }
    .to_bytes();

    let pad_len = (16 - ((20 + client_dh_inner.len()) % 16)) % 16;
    let mut hashed = Vec::with_capacity(20 + client_dh_inner.len() + pad_len);
    hashed.extend_from_slice(&sha1!(&client_dh_inner));
    hashed.extend_from_slice(&client_dh_inner);
    hashed.extend_from_slice(&random[256..256 + pad_len]);
    aes::ige_encrypt(&mut hashed, &state.key, &state.iv);

    let mut key_bytes = [0u8; 256];
    let gab_bytes = gab.to_bytes_be();
    key_bytes[256 - gab_bytes.len()..].copy_from_slice(&gab_bytes);
    state.auth_key = AuthKey::from_bytes(key_bytes);

    Ok((
        functions::SetClientDhParams {
            nonce: state.nonce,
            server_nonce: state.server_nonce,
            encrypted_data: hashed,
        },
        state,
    ))
}

// ─── finish: create_key ──────────────────────────────────────────────────────

/// Verify the server's answer to `set_client_DH_params`.
pub fn finish(data: Step3, response: enums::SetClientDhParamsAnswer) -> Result<Outcome, Error> {
    do_finish(data, response, &random_array::<272>()?)
}

pub fn do_finish(
    data: Step3,
    response: enums::SetClientDhParamsAnswer,
    random: &[u8; 272],
) -> Result<Outcome, Error> {
    let (nonce, server_nonce, hash, num) = match response {
        enums::SetClientDhParamsAnswer::DhGenOk(x) => (x.nonce, x.server_nonce, x.new_nonce_hash1, 1),
        enums::SetClientDhParamsAnswer::DhGenRetry(x) => (x.nonce, x.server_nonce, x.new_nonce_hash2, 2),
        enums::SetClientDhParamsAnswer::DhGenFail(x) => (x.nonce, x.server_nonce, x.new_nonce_hash3, 3),
    };

    check_nonce(&nonce, &data.nonce)?;
    check_server_nonce(&server_nonce, &data.server_nonce)?;
    if hash != data.auth_key.calc_new_nonce_hash(&data.new_nonce, num) {
        return Err(Error::InvalidNewNonceHash);
    }

    match num {
        1 => {
            let mut salt = [0u8; 8];
            for ((dst, a), b) in salt.iter_mut().zip(&data.new_nonce[..8]).zip(&data.server_nonce[..8]) {
                *dst = a ^ b;
            }
            Ok(Outcome::Done(Finished {
                auth_key: data.auth_key,
                time_offset: data.time_offset,
                first_salt: i64::from_le_bytes(salt),
            }))
        }
        2 => {
            if data.retries >= MAX_DH_RETRIES {
                return Err(Error::DhGenRetry);
            }
            let retry_id = data.auth_key.aux_hash();
            log::info!("server asked for a new g_b (retry {})", data.retries + 1);
            let mut next = data;
            next.retries += 1;
            let (req, state) = client_dh_params(next, retry_id, random)?;
            Ok(Outcome::Retry(req, state))
        }
        _ => Err(Error::DhGenFail),
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn unix_now() -> i32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i32).unwrap_or_default()
}

fn check_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else { Err(Error::InvalidNonce) }
}

fn check_server_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else { Err(Error::InvalidServerNonce) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_keys_match_advertised_fingerprints() {
        let keys = TrustedKeys::builtin();
        assert!(keys.find(&[-3414540481677951611]).is_some());
        assert!(keys.find(&[1, -5595554452916591101]).is_some());
        assert!(keys.find(&[1, 2, 3]).is_none());
    }

    #[test]
    fn step2_rejects_foreign_nonce() {
        let (_, s1) = do_step1(&[1; 16]);
        let res = types::ResPq {
            nonce: [2; 16],
            server_nonce: [3; 16],
            pq: 0x17ED48941A08F981u64.to_be_bytes().to_vec(),
            server_public_key_fingerprints: vec![-3414540481677951611],
        };
        let err = do_step2(s1, res, 2, &TrustedKeys::builtin(), &[0; 256]).unwrap_err();
        assert_eq!(err, Error::InvalidNonce);
    }

    #[test]
    fn step2_fails_closed_on_unknown_key() {
        let (_, s1) = do_step1(&[1; 16]);
        let res = types::ResPq {
            nonce: [1; 16],
            server_nonce: [3; 16],
            pq: 0x17ED48941A08F981u64.to_be_bytes().to_vec(),
            server_public_key_fingerprints: vec![42, 43],
        };
        let err = do_step2(s1, res, 2, &TrustedKeys::builtin(), &[0; 256]).unwrap_err();
        assert_eq!(err, Error::UntrustedServer { fingerprints: vec![42, 43] });
    }

    #[test]
    fn step2_builds_request() {
        let (_, s1) = do_step1(&[1; 16]);
        let res = types::ResPq {
            nonce: [1; 16],
            server_nonce: [3; 16],
            pq: 0x17ED48941A08F981u64.to_be_bytes().to_vec(),
            server_public_key_fingerprints: vec![7, -3414540481677951611],
        };
        let (req, _) = do_step2(s1, res, 2, &TrustedKeys::builtin(), &[9; 256]).unwrap();
        assert_eq!(req.p, 0x494C553Bu32.to_be_bytes());
        assert_eq!(req.q, 0x53911073u32.to_be_bytes());
        assert_eq!(req.public_key_fingerprint, -3414540481677951611);
        assert_eq!(req.encrypted_data.len(), 256);
    }

    #[test]
    fn bad_pq_size() {
        let (_, s1) = do_step1(&[1; 16]);
        let res = types::ResPq {
            nonce: [1; 16],
            server_nonce: [3; 16],
            pq: vec![1, 2, 3],
            server_public_key_fingerprints: vec![],
        };
        let err = do_step2(s1, res, 2, &TrustedKeys::builtin(), &[0; 256]).unwrap_err();
        assert_eq!(err, Error::InvalidPqSize { size: 3 });
    }
}
