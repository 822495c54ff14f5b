//! TGS exchange against the realm's KDCs over TCP.

use super::messages::{
    self, KDC_OPT_CANONICALIZE, KDC_OPT_FORWARDABLE, KDC_OPT_RENEWABLE, KU_TGS_REP_ENC_PART,
    KU_TGS_REQ_AUTH, KU_TGS_REQ_AUTH_CKSUM, PA_TGS_REQ,
};
use super::{Credential, EncType, EncryptionKey, Error, Principal, crypto};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kerberos_asn1::{
    Asn1Object, Checksum, EncTgsRepPart, KdcReqBody, KrbError, PaData, TgsRep, TgsReq,
};
use rand::Rng;
use std::{io, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, instrument, warn};

const MAX_REPLY_LEN: usize = 1 << 20;
const TGS_REP_TAG: u8 = 0x6d;
const KRB_ERROR_TAG: u8 = 0x7e;

/// Moves one encoded request to a KDC of `realm` and returns the raw reply.
#[async_trait]
pub trait KdcTransport: Send + Sync {
    async fn exchange(&self, realm: &str, kdcs: &[String], request: &[u8])
    -> Result<Vec<u8>, Error>;
}

/// RFC 4120 section 7.2.2 TCP transport: 4-byte big-endian length prefix,
/// KDCs tried in configuration order.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn send_one(&self, kdc: &str, request: &[u8]) -> io::Result<Vec<u8>> {
        let exchange = async {
            let mut stream = TcpStream::connect(kdc).await?;
            let len = u32::try_from(request.len())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "request too large"))?;
            stream.write_all(&len.to_be_bytes()).await?;
            stream.write_all(request).await?;
            stream.flush().await?;

            let reply_len = usize::try_from(stream.read_u32().await?)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "reply too large"))?;
            if reply_len > MAX_REPLY_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("reply of {reply_len} bytes exceeds limit"),
                ));
            }
            let mut reply = vec![0u8; reply_len];
            stream.read_exact(&mut reply).await?;
            Ok(reply)
        };
        timeout(self.timeout, exchange)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("{kdc} timed out")))?
    }
}

#[async_trait]
impl KdcTransport for TcpTransport {
    async fn exchange(
        &self,
        realm: &str,
        kdcs: &[String],
        request: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let mut last_error = None;
        for kdc in kdcs {
            match self.send_one(kdc, request).await {
                Ok(reply) => {
                    debug!(kdc, bytes = reply.len(), "KDC replied");
                    return Ok(reply);
                }
                Err(err) => {
                    warn!(kdc, error = %err, "KDC exchange failed");
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(source) => Err(Error::Network {
                realm: realm.to_string(),
                source,
            }),
            None => Err(Error::NoKdc(realm.to_string())),
        }
    }
}

/// A service ticket fresh from the KDC.
#[derive(Debug, Clone)]
pub struct IssuedTicket {
    pub client: Principal,
    pub server: Principal,
    pub ticket: Vec<u8>,
    pub key: EncryptionKey,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Ask the KDC for a ticket to `server` using the delegated TGT.
///
/// # Errors
/// Returns an error on transport failure, a KRB-ERROR reply, or a reply that
/// fails decryption or does not answer this request.
#[instrument(skip(transport, tgt), fields(server = %server))]
pub async fn request_service_ticket(
    transport: &dyn KdcTransport,
    kdcs: &[String],
    tgt: &Credential,
    server: &Principal,
    now: DateTime<Utc>,
) -> Result<IssuedTicket, Error> {
    let etype = tgt.key.enctype()?;
    let nonce = rand::thread_rng().r#gen::<u32>() & 0x7fff_ffff;
    let req_body = KdcReqBody {
        kdc_options: (KDC_OPT_FORWARDABLE | KDC_OPT_RENEWABLE | KDC_OPT_CANONICALIZE).into(),
        realm: server.realm.clone(),
        sname: Some(messages::principal_name(server)),
        till: messages::kerberos_time(tgt.end_time),
        nonce,
        etypes: vec![
            EncType::Aes256CtsHmacSha196.code(),
            EncType::Aes128CtsHmacSha196.code(),
        ],
        ..KdcReqBody::default()
    };

    let checksum = Checksum {
        cksumtype: etype.checksum_type(),
        checksum: crypto::checksum(&tgt.key, KU_TGS_REQ_AUTH_CKSUM, &req_body.build())?,
    };
    let authenticator = messages::authenticator(&tgt.client, Some(checksum), None, now);
    let ap_req = messages::ap_req(&tgt.ticket, &tgt.key, KU_TGS_REQ_AUTH, &authenticator, 0)?;
    let request = TgsReq {
        padata: Some(vec![PaData {
            padata_type: PA_TGS_REQ,
            padata_value: ap_req,
        }]),
        req_body,
        ..TgsReq::default()
    };

    let reply = transport
        .exchange(&server.realm, kdcs, &request.build())
        .await?;
    read_reply(&reply, tgt, server, nonce)
}

fn read_reply(
    reply: &[u8],
    tgt: &Credential,
    server: &Principal,
    nonce: u32,
) -> Result<IssuedTicket, Error> {
    match reply.first().copied() {
        Some(KRB_ERROR_TAG) => {
            let error: KrbError = messages::decode(reply)?;
            Err(Error::kdc(error.error_code, error.e_text))
        }
        Some(TGS_REP_TAG) => {
            let rep: TgsRep = messages::decode(reply)?;
            if rep.enc_part.etype != tgt.key.etype {
                return Err(Error::Protocol(format!(
                    "reply sealed with etype {} but the TGT session key is etype {}",
                    rep.enc_part.etype, tgt.key.etype
                )));
            }
            let plain = crypto::decrypt(&tgt.key, KU_TGS_REP_ENC_PART, &rep.enc_part.cipher)?;
            let part: EncTgsRepPart = messages::decode(&plain)?;
            if part.nonce != nonce {
                return Err(Error::Protocol("nonce mismatch".to_string()));
            }
            let issued_for = messages::principal(&part.sname, &part.srealm);
            if !issued_for.same_name(server) {
                debug!(canonical = %issued_for, "KDC canonicalized the service name");
            }
            let auth_time = messages::utc(&part.authtime)?;
            Ok(IssuedTicket {
                client: messages::principal(&rep.cname, &rep.crealm),
                server: issued_for,
                ticket: rep.ticket.build(),
                key: EncryptionKey::new(part.key.keytype, part.key.keyvalue.clone()),
                start_time: part
                    .starttime
                    .as_ref()
                    .map(messages::utc)
                    .transpose()?
                    .unwrap_or(auth_time),
                end_time: messages::utc(&part.endtime)?,
            })
        }
        _ => Err(Error::Protocol("unexpected message type".to_string())),
    }
}

/// A scripted KDC used by broker and kdc tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::krb5::testing::{ReplyPart, enc_tgs_rep_part, fake_ticket, krb_error, tgs_rep};
    use kerberos_asn1::ApReq;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) enum Script {
        Issue { lifetime: chrono::Duration },
        Fail { code: i32, text: String },
        Unreachable,
    }

    /// Decrypts the PA-TGS-REQ with the TGT session key and answers with a
    /// ticket whose session key is derived from the request nonce.
    pub(crate) struct MockKdc {
        tgt_key: EncryptionKey,
        script: Mutex<Vec<Script>>,
        pub(crate) calls: AtomicUsize,
    }

    impl MockKdc {
        pub(crate) fn new(tgt_key: EncryptionKey, script: Vec<Script>) -> Self {
            Self {
                tgt_key,
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn next_step(&self) -> Script {
            let mut script = self.script.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if script.len() > 1 {
                script.remove(0)
            } else {
                match script.first() {
                    Some(Script::Issue { lifetime }) => Script::Issue {
                        lifetime: *lifetime,
                    },
                    Some(Script::Fail { code, text }) => Script::Fail {
                        code: *code,
                        text: text.clone(),
                    },
                    Some(Script::Unreachable) | None => Script::Unreachable,
                }
            }
        }

        fn answer(&self, request: &[u8], lifetime: chrono::Duration) -> Result<Vec<u8>, Error> {
            let request: TgsReq = messages::decode(request)?;
            let pa = request
                .padata
                .as_ref()
                .and_then(|padata| padata.iter().find(|pa| pa.padata_type == PA_TGS_REQ))
                .ok_or_else(|| Error::Protocol("no PA-TGS-REQ".into()))?;
            let ap_req: ApReq = messages::decode(&pa.padata_value)?;
            let authenticator =
                messages::open_authenticator(&ap_req, &self.tgt_key, KU_TGS_REQ_AUTH)?;
            let checksum = authenticator
                .cksum
                .ok_or_else(|| Error::Protocol("authenticator without checksum".into()))?;
            let body = request.req_body.build();
            if checksum.checksum != crypto::checksum(&self.tgt_key, KU_TGS_REQ_AUTH_CKSUM, &body)? {
                return Err(Error::Integrity);
            }
            let sname = request
                .req_body
                .sname
                .as_ref()
                .ok_or_else(|| Error::Protocol("no sname".into()))?;
            let server = messages::principal(sname, &request.req_body.realm);
            let client = messages::principal(&authenticator.cname, &authenticator.crealm);
            let nonce = request.req_body.nonce;
            let now = Utc::now();
            let key = EncryptionKey::new(18, nonce.to_be_bytes().repeat(8));
            let part = enc_tgs_rep_part(&ReplyPart {
                key: &key,
                nonce,
                flags: 0x4028_0000,
                auth_time: now,
                start_time: Some(now),
                end_time: now + lifetime,
                server: &server,
            });
            let cipher = crypto::encrypt(&self.tgt_key, KU_TGS_REP_ENC_PART, &part)?;
            Ok(tgs_rep(&client, &fake_ticket(&server), self.tgt_key.etype, &cipher))
        }
    }

    #[async_trait]
    impl KdcTransport for MockKdc {
        async fn exchange(
            &self,
            realm: &str,
            _kdcs: &[String],
            request: &[u8],
        ) -> Result<Vec<u8>, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.next_step() {
                Script::Issue { lifetime } => self.answer(request, lifetime),
                Script::Fail { code, text } => Ok(krb_error(code, &text)),
                Script::Unreachable => Err(Error::Network {
                    realm: realm.to_string(),
                    source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
                }),
            }
        }
    }
}
