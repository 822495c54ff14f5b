//! PostgreSQL client connections authenticated with a GSS token taken from
//! the process-wide token source at the moment the server asks for one.

use super::{
    ConnectParams, TokenSourceRegistry,
    protocol::{BackendMessage, MAX_MESSAGE_LEN, ProtocolError, ServerError, frontend},
    value::{Column, PgValue, Row},
};
use crate::broker::{BrokerError, GssProvider};
use bytes::{Bytes, BytesMut};
use rustls::{ClientConfig, RootCertStore, crypto::ring, pki_types::ServerName};
use std::{collections::HashMap, fmt, fs::File, io::BufReader, path::Path, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, trace, warn};

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

fn transport(err: impl fmt::Display) -> BrokerError {
    BrokerError::DownstreamTransportError(err.to_string())
}

fn application(err: ServerError) -> BrokerError {
    BrokerError::DownstreamApplicationError {
        code: err.code,
        message: err.message,
    }
}

/// Where the GSS exchange with one server stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    TokenSent,
    Established,
    Failed,
}

/// Build the client TLS configuration from a PEM bundle, or the platform
/// trust store when none is given.
///
/// # Errors
/// Returns `ConfigInvalid` if the bundle cannot be read or holds no usable
/// certificate.
pub fn tls_config(ca_bundle: Option<&Path>) -> Result<ClientConfig, BrokerError> {
    let invalid = |e: &dyn fmt::Display| BrokerError::ConfigInvalid(format!("database TLS: {e}"));
    let mut roots = RootCertStore::empty();
    match ca_bundle {
        Some(path) => {
            let file = File::open(path).map_err(|e| invalid(&format!("{}: {e}", path.display())))?;
            for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
                roots
                    .add(cert.map_err(|e| invalid(&e))?)
                    .map_err(|e| invalid(&e))?;
            }
            if roots.is_empty() {
                return Err(invalid(&format!("no certificates in {}", path.display())));
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs();
            for error in &native.errors {
                warn!("failed to load a native root certificate: {error}");
            }
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            debug!(added, ignored, "loaded native root certificates");
        }
    }
    Ok(ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| invalid(&e))?
        .with_root_certificates(roots)
        .with_no_client_auth())
}

struct Wire {
    stream: BufStream<Box<dyn Stream>>,
    buf: BytesMut,
}

impl Wire {
    fn new(stream: Box<dyn Stream>) -> Self {
        Self {
            stream: BufStream::new(stream),
            buf: BytesMut::with_capacity(512),
        }
    }

    async fn send(&mut self, encode: impl FnOnce(&mut BytesMut)) -> Result<(), BrokerError> {
        self.buf.clear();
        encode(&mut self.buf);
        self.stream.write_all(&self.buf).await.map_err(transport)?;
        self.stream.flush().await.map_err(transport)
    }

    async fn recv(&mut self) -> Result<BackendMessage, BrokerError> {
        let tag = self.stream.read_u8().await.map_err(transport)?;
        let len = self.stream.read_i32().await.map_err(transport)?;
        let len = usize::try_from(len)
            .ok()
            .filter(|len| (4..=MAX_MESSAGE_LEN).contains(len))
            .ok_or_else(|| transport(ProtocolError::Length(usize::try_from(len).unwrap_or(0))))?;
        let mut body = vec![0; len - 4];
        self.stream.read_exact(&mut body).await.map_err(transport)?;
        BackendMessage::parse(tag, Bytes::from(body)).map_err(transport)
    }

    /// Skip to the end of the current exchange.
    async fn drain(&mut self) -> Result<(), BrokerError> {
        loop {
            if let BackendMessage::ReadyForQuery(_) = self.recv().await? {
                return Ok(());
            }
        }
    }
}

/// Drives the PostgreSQL GSS authentication exchange.
#[derive(Debug)]
pub struct WireGssAdapter {
    params: ConnectParams,
    tls: Option<Arc<ClientConfig>>,
}

impl WireGssAdapter {
    /// # Errors
    /// Returns `ConfigInvalid` when TLS is wanted and the trust roots cannot
    /// be loaded.
    pub fn new(params: ConnectParams) -> Result<Self, BrokerError> {
        let tls = if params.attempts_tls() {
            Some(Arc::new(tls_config(params.ca_bundle.as_deref())?))
        } else {
            None
        };
        Ok(Self { params, tls })
    }

    #[must_use]
    pub fn params(&self) -> &ConnectParams {
        &self.params
    }

    async fn open(&self) -> Result<Box<dyn Stream>, BrokerError> {
        let mut tcp = TcpStream::connect((self.params.host.as_str(), self.params.port))
            .await
            .map_err(|e| transport(format!("{}:{}: {e}", self.params.host, self.params.port)))?;
        tcp.set_nodelay(true).map_err(transport)?;
        let Some(config) = self.tls.as_ref() else {
            return Ok(Box::new(tcp));
        };

        let mut request = BytesMut::with_capacity(8);
        frontend::ssl_request(&mut request);
        tcp.write_all(&request).await.map_err(transport)?;
        match tcp.read_u8().await.map_err(transport)? {
            b'S' => {
                let server_name = ServerName::try_from(self.params.host.clone())
                    .map_err(|e| BrokerError::ConfigInvalid(format!("database host: {e}")))?;
                let tls = TlsConnector::from(Arc::clone(config))
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| transport(format!("TLS handshake failed: {e}")))?;
                trace!("database transport upgraded to TLS");
                Ok(Box::new(tls))
            }
            b'N' if self.params.requires_tls() => Err(transport(format!(
                "server refused TLS and sslmode is {:?}",
                self.params.ssl_mode
            ))),
            b'N' => Ok(Box::new(tcp)),
            other => Err(transport(format!(
                "unexpected answer {other:#04x} to SSLRequest"
            ))),
        }
    }

    /// Connect as `user` and authenticate with the token source registered
    /// in `registry` when the server asks for GSS.
    ///
    /// # Errors
    /// `DownstreamAuthRejected` when the server refuses the token or asks for
    /// another method, `DownstreamTransportError` on I/O failures and
    /// `DownstreamApplicationError` when startup fails after authentication.
    #[instrument(skip(self, registry), fields(host = %self.params.host, port = self.params.port))]
    pub async fn authenticate(
        &self,
        user: &str,
        registry: &TokenSourceRegistry,
    ) -> Result<AuthenticatedConnection, BrokerError> {
        let stream = timeout(self.params.connect_timeout, self.open())
            .await
            .map_err(|_| transport("timed out connecting to the database"))??;
        let mut wire = Wire::new(stream);

        let mut startup = vec![("user", user), ("client_encoding", "UTF8")];
        if let Some(database) = self.params.database.as_deref() {
            startup.push(("database", database));
        }
        startup.push(("application_name", env!("CARGO_PKG_NAME")));
        wire.send(|buf| frontend::startup(buf, &startup)).await?;

        let mut state = HandshakeState::Init;
        let mut provider: Option<Arc<dyn GssProvider>> = None;
        let result = self
            .exchange(&mut wire, registry, &mut state, &mut provider)
            .await;
        if result.is_err() {
            state = HandshakeState::Failed;
        }
        debug!(?state, "GSS handshake finished");
        result?;

        let mut parameters = HashMap::new();
        let mut backend_key = None;
        loop {
            match wire.recv().await? {
                BackendMessage::ParameterStatus { name, value } => {
                    parameters.insert(name, value);
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => backend_key = Some((process_id, secret_key)),
                BackendMessage::ReadyForQuery(_) => break,
                BackendMessage::ErrorResponse(error) => return Err(application(error)),
                BackendMessage::NoticeResponse(notice) => debug!(%notice, "startup notice"),
                other => {
                    return Err(transport(format!(
                        "unexpected {other:?} during connection startup"
                    )));
                }
            }
        }

        Ok(AuthenticatedConnection {
            wire,
            user: user.to_string(),
            parameters,
            backend_key,
            poisoned: false,
        })
    }

    async fn exchange(
        &self,
        wire: &mut Wire,
        registry: &TokenSourceRegistry,
        state: &mut HandshakeState,
        provider: &mut Option<Arc<dyn GssProvider>>,
    ) -> Result<(), BrokerError> {
        loop {
            match wire.recv().await? {
                BackendMessage::AuthenticationGss => {
                    if *state != HandshakeState::Init {
                        return Err(BrokerError::DownstreamAuthRejected(
                            "server asked for a second GSS token".to_string(),
                        ));
                    }
                    // looked up when the server asks, never earlier
                    let source = registry.current().ok_or_else(|| {
                        BrokerError::TokenEncodingFailed(format!(
                            "no token source registered for {}/{}",
                            self.params.krbsrvname, self.params.host
                        ))
                    })?;
                    let token = source.init_token(&self.params.krbsrvname, &self.params.host)?;
                    wire.send(|buf| frontend::gss_response(buf, &token)).await?;
                    *state = HandshakeState::TokenSent;
                    trace!(principal = %source.principal(), "GSS token sent");
                    *provider = Some(source);
                }
                BackendMessage::AuthenticationGssContinue(peer) => {
                    let Some(source) = provider.as_ref() else {
                        return Err(BrokerError::DownstreamAuthRejected(
                            "GSS continuation before any token was sent".to_string(),
                        ));
                    };
                    let (done, next) = source.continue_with(&peer)?;
                    if let Some(next) = next {
                        wire.send(|buf| frontend::gss_response(buf, &next)).await?;
                    }
                    trace!(done, "GSS continuation accepted");
                }
                BackendMessage::AuthenticationOk => {
                    if *state == HandshakeState::Init {
                        warn!("server accepted the connection without GSS authentication");
                    }
                    *state = HandshakeState::Established;
                    return Ok(());
                }
                BackendMessage::AuthenticationOther(code) => {
                    return Err(BrokerError::DownstreamAuthRejected(format!(
                        "server requested unsupported authentication method {code}"
                    )));
                }
                BackendMessage::ErrorResponse(error) => {
                    return Err(BrokerError::DownstreamAuthRejected(error.to_string()));
                }
                BackendMessage::NoticeResponse(notice) => debug!(%notice, "authentication notice"),
                other => {
                    return Err(transport(format!(
                        "unexpected {other:?} during authentication"
                    )));
                }
            }
        }
    }
}

/// A connection that finished startup. Never pooled; dropped or closed at
/// the end of the request.
pub struct AuthenticatedConnection {
    wire: Wire,
    user: String,
    parameters: HashMap<String, String>,
    backend_key: Option<(i32, i32)>,
    poisoned: bool,
}

impl fmt::Debug for AuthenticatedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedConnection")
            .field("user", &self.user)
            .field("parameters", &self.parameters)
            .field("backend_pid", &self.backend_key.map(|(pid, _)| pid))
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl AuthenticatedConnection {
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// True once a row stream was abandoned mid-way; the connection can no
    /// longer be used.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Run `statement` with text parameters through the extended query
    /// protocol. Rows are read from the socket as the stream is consumed.
    ///
    /// # Errors
    /// `DownstreamApplicationError` when the server rejects the statement,
    /// `DownstreamTransportError` on I/O failures or a poisoned connection.
    #[instrument(skip(self, params), fields(user = %self.user))]
    pub async fn query(
        &mut self,
        statement: &str,
        params: &[Option<&str>],
    ) -> Result<RowStream<'_>, BrokerError> {
        if self.poisoned {
            return Err(transport("connection poisoned by an abandoned row stream"));
        }
        self.poisoned = true;
        self.wire
            .send(|buf| {
                frontend::parse(buf, "", statement);
                frontend::bind(buf, "", "", params);
                frontend::describe_portal(buf, "");
                frontend::execute(buf, "");
                frontend::sync(buf);
            })
            .await?;

        let mut columns = Vec::new();
        loop {
            match self.wire.recv().await? {
                BackendMessage::ParseComplete | BackendMessage::BindComplete => {}
                BackendMessage::RowDescription(fields) => {
                    columns = fields
                        .into_iter()
                        .map(|field| Column {
                            name: field.name,
                            type_oid: field.type_oid,
                        })
                        .collect();
                    break;
                }
                BackendMessage::NoData => break,
                BackendMessage::NoticeResponse(notice) => debug!(%notice, "query notice"),
                BackendMessage::ErrorResponse(error) => {
                    self.wire.drain().await?;
                    self.poisoned = false;
                    return Err(application(error));
                }
                other => return Err(transport(format!("unexpected {other:?} before rows"))),
            }
        }
        self.poisoned = false;
        Ok(RowStream {
            conn: self,
            columns: columns.into(),
            finished: false,
        })
    }

    /// [`query`](Self::query) drained into memory.
    ///
    /// # Errors
    /// See [`query`](Self::query).
    pub async fn execute(
        &mut self,
        statement: &str,
        params: &[Option<&str>],
    ) -> Result<Vec<Row>, BrokerError> {
        self.query(statement, params).await?.collect().await
    }

    /// Send Terminate and shut the transport down.
    ///
    /// # Errors
    /// Returns `DownstreamTransportError` if the goodbye cannot be written.
    pub async fn close(mut self) -> Result<(), BrokerError> {
        self.wire.send(frontend::terminate).await?;
        self.wire.stream.shutdown().await.map_err(transport)
    }
}

/// Rows of one statement, read lazily. Not restartable; abandoning it
/// before the end poisons the connection.
pub struct RowStream<'a> {
    conn: &'a mut AuthenticatedConnection,
    columns: Arc<[Column]>,
    finished: bool,
}

impl fmt::Debug for RowStream<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowStream")
            .field("columns", &self.columns)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl RowStream<'_> {
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// The next row, or `None` once the statement completed.
    ///
    /// # Errors
    /// `DownstreamApplicationError` if the statement fails mid-way,
    /// `DownstreamTransportError` on I/O failures.
    pub async fn next(&mut self) -> Result<Option<Row>, BrokerError> {
        if self.finished {
            return Ok(None);
        }
        loop {
            let message = match self.conn.wire.recv().await {
                Ok(message) => message,
                Err(err) => {
                    self.finished = true;
                    self.conn.poisoned = true;
                    return Err(err);
                }
            };
            match message {
                BackendMessage::DataRow(values) => {
                    let values = self
                        .columns
                        .iter()
                        .zip(values.iter().map(|v| v.as_deref()).chain(std::iter::repeat(None)))
                        .map(|(column, raw)| PgValue::decode(column.type_oid, raw))
                        .collect();
                    return Ok(Some(Row::new(Arc::clone(&self.columns), values)));
                }
                BackendMessage::CommandComplete(tag) => trace!(%tag, "statement complete"),
                BackendMessage::EmptyQueryResponse | BackendMessage::NoticeResponse(_) => {}
                BackendMessage::ReadyForQuery(_) => {
                    self.finished = true;
                    return Ok(None);
                }
                BackendMessage::ErrorResponse(error) => {
                    self.finished = true;
                    if let Err(err) = self.conn.wire.drain().await {
                        self.conn.poisoned = true;
                        return Err(err);
                    }
                    return Err(application(error));
                }
                other => {
                    self.finished = true;
                    self.conn.poisoned = true;
                    return Err(transport(format!("unexpected {other:?} in row stream")));
                }
            }
        }
    }

    /// Read every remaining row.
    ///
    /// # Errors
    /// See [`next`](Self::next).
    pub async fn collect(mut self) -> Result<Vec<Row>, BrokerError> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Give up on the remaining rows. The connection is unusable afterwards.
    pub fn abort(mut self) {
        if !self.finished {
            self.finished = true;
            self.conn.poisoned = true;
        }
    }
}

impl Drop for RowStream<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.conn.poisoned = true;
        }
    }
}
