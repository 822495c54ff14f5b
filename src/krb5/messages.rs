//! Glue between our principal and key types and the `kerberos_asn1` message
//! structs (RFC 4120), plus the RFC 2743 framing that turns an AP-REQ into a
//! GSS-API initial context token (RFC 4121).

use super::{EncryptionKey, Error, Principal, crypto};
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use kerberos_asn1::{
    ApReq, Asn1Object, Authenticator, Checksum, EncryptedData, KerberosTime, PrincipalName, Ticket,
};

pub const KU_TGS_REQ_AUTH_CKSUM: i32 = 6;
pub const KU_TGS_REQ_AUTH: i32 = 7;
pub const KU_TGS_REP_ENC_PART: i32 = 8;
pub const KU_AP_REQ_AUTH: i32 = 11;

pub const PVNO: i32 = 5;
pub const MSG_AP_REQ: i32 = 14;
pub const PA_TGS_REQ: i32 = 1;

pub const AP_OPTION_MUTUAL_REQUIRED: u32 = 0x2000_0000;

pub const KDC_OPT_FORWARDABLE: u32 = 0x4000_0000;
pub const KDC_OPT_RENEWABLE: u32 = 0x0080_0000;
pub const KDC_OPT_CANONICALIZE: u32 = 0x0001_0000;

/// `1.2.840.113554.1.2.2`, the Kerberos V5 GSS mechanism, as a DER OID.
pub const KRB5_MECH_OID: [u8; 11] = [
    0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x12, 0x01, 0x02, 0x02,
];
const TOK_ID_AP_REQ: [u8; 2] = [0x01, 0x00];
const GSS_TOKEN_TAG: u8 = 0x60;

pub const GSS_CHECKSUM_TYPE: i32 = 0x8003;
const GSS_CHECKSUM_LEN: usize = 24;

const KERBEROS_TIME: &str = "%Y%m%d%H%M%S";

/// Parse exactly one message of type `T`.
///
/// # Errors
/// Returns `Asn1` when the bytes do not decode or trailing data follows.
pub fn decode<T: Asn1Object>(raw: &[u8]) -> Result<T, Error> {
    let (rest, value) = T::parse(raw).map_err(Error::asn1)?;
    if !rest.is_empty() {
        return Err(Error::Asn1(format!("{} trailing bytes", rest.len())));
    }
    Ok(value)
}

#[must_use]
pub fn principal_name(principal: &Principal) -> PrincipalName {
    PrincipalName {
        name_type: principal.name_type,
        name_string: principal.components.clone(),
    }
}

#[must_use]
pub fn principal(name: &PrincipalName, realm: &str) -> Principal {
    Principal::new(name.name_type, realm, name.name_string.clone())
}

/// Kerberos times carry whole seconds only.
#[must_use]
pub fn kerberos_time(at: DateTime<Utc>) -> KerberosTime {
    KerberosTime::from(at.trunc_subsecs(0))
}

/// Read a `KerberosTime` back through its DER form, `YYYYMMDDHHMMSSZ`.
///
/// # Errors
/// Returns `Asn1` if the encoded value is not a generalized time.
pub fn utc(time: &KerberosTime) -> Result<DateTime<Utc>, Error> {
    let encoded = time.build();
    let text = encoded
        .get(2..)
        .and_then(|body| std::str::from_utf8(body).ok())
        .ok_or_else(|| Error::Asn1("KerberosTime is not text".to_string()))?;
    let seconds = text.trim_end_matches('Z');
    let seconds = seconds.split_once('.').map_or(seconds, |(whole, _)| whole);
    NaiveDateTime::parse_from_str(seconds, KERBEROS_TIME)
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::Asn1(format!("KerberosTime {text}: {e}")))
}

/// The RFC 4121 authenticator checksum carrying GSS context flags.
#[must_use]
pub fn gss_checksum(flags: u32) -> Checksum {
    let mut checksum = Vec::with_capacity(GSS_CHECKSUM_LEN);
    checksum.extend_from_slice(&16u32.to_le_bytes());
    checksum.extend_from_slice(&[0u8; 16]);
    checksum.extend_from_slice(&flags.to_le_bytes());
    Checksum {
        cksumtype: GSS_CHECKSUM_TYPE,
        checksum,
    }
}

/// Flags carried by a GSS checksum.
///
/// # Errors
/// Returns an error if this is not a well-formed 0x8003 checksum.
pub fn gss_flags(checksum: &Checksum) -> Result<u32, Error> {
    match checksum.checksum.get(20..24) {
        Some(&[a, b, c, d]) if checksum.cksumtype == GSS_CHECKSUM_TYPE => {
            Ok(u32::from_le_bytes([a, b, c, d]))
        }
        _ => Err(Error::Asn1("not a GSS checksum".to_string())),
    }
}

#[must_use]
pub fn authenticator(
    client: &Principal,
    cksum: Option<Checksum>,
    seq_number: Option<u32>,
    now: DateTime<Utc>,
) -> Authenticator {
    Authenticator {
        crealm: client.realm.clone(),
        cname: principal_name(client),
        cksum,
        ctime: kerberos_time(now),
        seq_number,
        ..Authenticator::default()
    }
}

/// Seal `authenticator` under `key` and pair it with `ticket`, which is
/// forwarded as received from the KDC or the credential cache.
///
/// # Errors
/// Returns an error when `ticket` is not a DER ticket or the key cannot
/// encrypt.
pub fn ap_req(
    ticket: &[u8],
    key: &EncryptionKey,
    usage: i32,
    authenticator: &Authenticator,
    ap_options: u32,
) -> Result<Vec<u8>, Error> {
    let ticket: Ticket = decode(ticket)?;
    let request = ApReq {
        pvno: PVNO,
        msg_type: MSG_AP_REQ,
        ap_options: ap_options.into(),
        ticket,
        authenticator: EncryptedData {
            etype: key.etype,
            kvno: None,
            cipher: crypto::encrypt(key, usage, &authenticator.build())?,
        },
    };
    Ok(request.build())
}

/// Decrypt the authenticator of `request` the way the accepting service
/// would.
///
/// # Errors
/// Returns an error when `key` is of another enctype or does not open it.
pub fn open_authenticator(
    request: &ApReq,
    key: &EncryptionKey,
    usage: i32,
) -> Result<Authenticator, Error> {
    if request.authenticator.etype != key.etype {
        return Err(Error::Protocol(format!(
            "authenticator sealed with etype {} but the key is etype {}",
            request.authenticator.etype, key.etype
        )));
    }
    decode(&crypto::decrypt(key, usage, &request.authenticator.cipher)?)
}

fn push_length(out: &mut Vec<u8>, len: usize) {
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    match bytes.get(skip..) {
        Some(&[short]) if short < 0x80 => out.push(short),
        Some([]) => out.push(0),
        Some(long) => {
            out.push(0x80 | u8::try_from(long.len()).unwrap_or(0x7f));
            out.extend_from_slice(long);
        }
        None => out.push(0),
    }
}

fn split_length(input: &[u8]) -> Result<(usize, &[u8]), Error> {
    let truncated = || Error::Asn1("truncated GSS token".to_string());
    let (&first, rest) = input.split_first().ok_or_else(truncated)?;
    if first < 0x80 {
        return Ok((usize::from(first), rest));
    }
    let width = usize::from(first & 0x7f);
    if width == 0 || width > 4 {
        return Err(Error::Asn1("unsupported GSS token length".to_string()));
    }
    let (digits, rest) = rest.split_at_checked(width).ok_or_else(truncated)?;
    let len = digits
        .iter()
        .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
    Ok((len, rest))
}

/// Frame an AP-REQ as an RFC 2743 initial context token for the krb5 mech.
#[must_use]
pub fn gss_wrap(ap_req: &[u8]) -> Vec<u8> {
    let inner_len = KRB5_MECH_OID.len() + TOK_ID_AP_REQ.len() + ap_req.len();
    let mut token = Vec::with_capacity(inner_len + 6);
    token.push(GSS_TOKEN_TAG);
    push_length(&mut token, inner_len);
    token.extend_from_slice(&KRB5_MECH_OID);
    token.extend_from_slice(&TOK_ID_AP_REQ);
    token.extend_from_slice(ap_req);
    token
}

/// Strip the initial-context-token framing, returning the inner AP-REQ.
///
/// # Errors
/// Returns an error for foreign mechanisms or token types.
pub fn gss_unwrap(token: &[u8]) -> Result<&[u8], Error> {
    let rest = match token.split_first() {
        Some((&GSS_TOKEN_TAG, rest)) => rest,
        _ => return Err(Error::Asn1("not a GSS initial context token".to_string())),
    };
    let (len, body) = split_length(rest)?;
    if body.len() != len {
        return Err(Error::Asn1("GSS token length mismatch".to_string()));
    }
    body.strip_prefix(&KRB5_MECH_OID[..])
        .ok_or_else(|| Error::Asn1("not a Kerberos V5 mechanism token".to_string()))?
        .strip_prefix(&TOK_ID_AP_REQ[..])
        .ok_or_else(|| Error::Asn1("not an AP-REQ token".to_string()))
}
