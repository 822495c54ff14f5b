//! DER fixtures for the KDC side of the exchange. Replies are written byte by
//! byte so tests exercise the `kerberos_asn1` decoders against an encoding
//! they did not produce themselves.

use super::{EncryptionKey, Principal};
use chrono::{DateTime, SubsecRound, Utc};

const INTEGER: u8 = 0x02;
const BIT_STRING: u8 = 0x03;
const OCTET_STRING: u8 = 0x04;
const GENERALIZED_TIME: u8 = 0x18;
const GENERAL_STRING: u8 = 0x1b;
const SEQUENCE: u8 = 0x30;

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len().to_be_bytes();
    let skip = len.iter().take_while(|b| **b == 0).count();
    match &len[skip..] {
        [short] if *short < 0x80 => out.push(*short),
        [] => out.push(0),
        long => {
            out.push(0x80 | u8::try_from(long.len()).unwrap_or(0x7f));
            out.extend_from_slice(long);
        }
    }
    out.extend_from_slice(content);
    out
}

fn integer(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    // minimal two's complement
    while start < bytes.len() - 1 {
        let (head, next) = (bytes[start], bytes[start + 1]);
        if (head == 0x00 && next & 0x80 == 0) || (head == 0xff && next & 0x80 != 0) {
            start += 1;
        } else {
            break;
        }
    }
    tlv(INTEGER, &bytes[start..])
}

fn general_string(value: &str) -> Vec<u8> {
    tlv(GENERAL_STRING, value.as_bytes())
}

fn time(at: DateTime<Utc>) -> Vec<u8> {
    tlv(
        GENERALIZED_TIME,
        at.trunc_subsecs(0).format("%Y%m%d%H%M%SZ").to_string().as_bytes(),
    )
}

fn flags(bits: u32) -> Vec<u8> {
    let mut content = vec![0];
    content.extend_from_slice(&bits.to_be_bytes());
    tlv(BIT_STRING, &content)
}

fn sequence(items: &[Vec<u8>]) -> Vec<u8> {
    tlv(SEQUENCE, &items.concat())
}

fn field(n: u8, inner: &[u8]) -> Vec<u8> {
    tlv(0xa0 | n, inner)
}

fn app(n: u8, inner: &[u8]) -> Vec<u8> {
    tlv(0x60 | n, inner)
}

fn principal_name(principal: &Principal) -> Vec<u8> {
    let components: Vec<Vec<u8>> = principal
        .components
        .iter()
        .map(|c| general_string(c))
        .collect();
    sequence(&[
        field(0, &integer(i64::from(principal.name_type))),
        field(1, &sequence(&components)),
    ])
}

fn encrypted_data(etype: i32, kvno: Option<u32>, cipher: &[u8]) -> Vec<u8> {
    let mut fields = vec![field(0, &integer(i64::from(etype)))];
    if let Some(kvno) = kvno {
        fields.push(field(1, &integer(i64::from(kvno))));
    }
    fields.push(field(2, &tlv(OCTET_STRING, cipher)));
    sequence(&fields)
}

/// A well-formed `Ticket ::= [APPLICATION 1]` whose enc-part nobody opens.
pub(crate) fn fake_ticket(server: &Principal) -> Vec<u8> {
    app(
        1,
        &sequence(&[
            field(0, &integer(5)),
            field(1, &general_string(&server.realm)),
            field(2, &principal_name(server)),
            field(3, &encrypted_data(18, Some(2), &[0x5a; 48])),
        ]),
    )
}

/// What the KDC seals into `EncTGSRepPart`.
pub(crate) struct ReplyPart<'a> {
    pub key: &'a EncryptionKey,
    pub nonce: u32,
    pub flags: u32,
    pub auth_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: DateTime<Utc>,
    pub server: &'a Principal,
}

pub(crate) fn enc_tgs_rep_part(part: &ReplyPart<'_>) -> Vec<u8> {
    let key = sequence(&[
        field(0, &integer(i64::from(part.key.etype))),
        field(1, &tlv(OCTET_STRING, part.key.value())),
    ]);
    let mut fields = vec![
        field(0, &key),
        field(1, &sequence(&[])),
        field(2, &integer(i64::from(part.nonce))),
        field(4, &flags(part.flags)),
        field(5, &time(part.auth_time)),
    ];
    if let Some(start) = part.start_time {
        fields.push(field(6, &time(start)));
    }
    fields.push(field(7, &time(part.end_time)));
    fields.push(field(9, &general_string(&part.server.realm)));
    fields.push(field(10, &principal_name(part.server)));
    app(26, &sequence(&fields))
}

pub(crate) fn tgs_rep(client: &Principal, ticket: &[u8], etype: i32, cipher: &[u8]) -> Vec<u8> {
    app(
        13,
        &sequence(&[
            field(0, &integer(5)),
            field(1, &integer(13)),
            field(3, &general_string(&client.realm)),
            field(4, &principal_name(client)),
            field(5, ticket),
            field(6, &encrypted_data(etype, None, cipher)),
        ]),
    )
}

pub(crate) fn krb_error(code: i32, text: &str) -> Vec<u8> {
    app(
        30,
        &sequence(&[
            field(0, &integer(5)),
            field(1, &integer(30)),
            field(4, &time(Utc::now())),
            field(5, &integer(0)),
            field(6, &integer(i64::from(code))),
            field(9, &general_string("EXAMPLE.COM")),
            field(10, &principal_name(&Principal::krbtgt("EXAMPLE.COM"))),
            field(11, &general_string(text)),
        ]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::krb5::messages;
    use kerberos_asn1::{KrbError, Ticket};

    #[test]
    fn integers_are_minimal() {
        assert_eq!(integer(0), vec![0x02, 0x01, 0x00]);
        assert_eq!(integer(128), vec![0x02, 0x02, 0x00, 0x80]);
        assert_eq!(integer(-1), vec![0x02, 0x01, 0xff]);
        assert_eq!(integer(0x8003), vec![0x02, 0x03, 0x00, 0x80, 0x03]);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn fixtures_decode_as_kerberos_messages() {
        let server = Principal::service("HTTP", "ipa.example.com", "EXAMPLE.COM");
        let ticket: Ticket = messages::decode(&fake_ticket(&server)).unwrap();
        assert!(messages::principal(&ticket.sname, &ticket.realm).same_name(&server));

        let error: KrbError = messages::decode(&krb_error(7, "not found")).unwrap();
        assert_eq!(error.error_code, 7);
        assert_eq!(error.e_text.as_deref(), Some("not found"));
    }
}
