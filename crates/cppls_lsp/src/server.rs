//! Request dispatch and server lifecycle.
//!
//! Handlers are registered by method name. Requests run as spawned tasks
//! and answer in completion order with their original id; notifications
//! are fire-and-forget with errors logged. Requests arriving in the wrong
//! lifecycle phase get a typed error instead of a handler.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use lsp_types::{
    DeclarationCapability, DidChangeTextDocumentParams, DidCloseTextDocumentParams,
    DidOpenTextDocumentParams, DidSaveTextDocumentParams, ExecuteCommandOptions,
    InitializeParams, InitializeResult, OneOf, ServerCapabilities, ServerInfo,
    TextDocumentSyncCapability, TextDocumentSyncKind,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;

use cppls::config::Config;
use cppls::frontend::FrontEnd;

use crate::features;
use crate::indexer;
use crate::plugin::Hook;
use crate::proto::{self, PositionEncoding};
use crate::scheduler;
use crate::state::{Phase, ServerCtx};
use crate::transport::{
    error_codes, read_message, write_message, Message, Request, Response, ResponseError,
};

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, ResponseError>> + Send>>;
type RequestHandler = Box<dyn Fn(Arc<ServerCtx>, Value) -> HandlerFuture + Send + Sync>;
type NotifyFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type NotificationHandler = Box<dyn Fn(Arc<ServerCtx>, Value) -> NotifyFuture + Send + Sync>;

pub struct Server {
    pub ctx: Arc<ServerCtx>,
    requests: HashMap<&'static str, RequestHandler>,
    notifications: HashMap<&'static str, NotificationHandler>,
    outgoing_rx: Option<mpsc::UnboundedReceiver<Message>>,
}

impl Server {
    pub fn new(frontend: Arc<dyn FrontEnd>) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let ctx = ServerCtx::new(frontend, outgoing_tx);
        let mut server = Self {
            ctx,
            requests: HashMap::new(),
            notifications: HashMap::new(),
            outgoing_rx: Some(outgoing_rx),
        };
        server.register_methods();
        server
    }

    fn add_request<P, F, Fut>(&mut self, method: &'static str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(Arc<ServerCtx>, P) -> Fut + Send + Sync + Copy + 'static,
        Fut: Future<Output = Result<Value, ResponseError>> + Send + 'static,
    {
        self.requests.insert(
            method,
            Box::new(move |ctx, value| {
                Box::pin(async move {
                    let params: P = serde_json::from_value(value).map_err(|e| ResponseError {
                        code: error_codes::INVALID_PARAMS,
                        message: e.to_string(),
                    })?;
                    handler(ctx, params).await
                })
            }),
        );
    }

    fn add_notification<P, F, Fut>(&mut self, method: &'static str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(Arc<ServerCtx>, P) -> Fut + Send + Sync + Copy + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.notifications.insert(
            method,
            Box::new(move |ctx, value| {
                Box::pin(async move {
                    match serde_json::from_value::<P>(value) {
                        Ok(params) => handler(ctx, params).await,
                        Err(error) => {
                            tracing::warn!(method, %error, "dropping malformed notification")
                        }
                    }
                })
            }),
        );
    }

    fn register_methods(&mut self) {
        self.add_request("initialize", on_initialize);
        self.add_request("shutdown", on_shutdown);
        self.add_request("textDocument/definition", features::goto_definition);
        self.add_request("textDocument/declaration", features::goto_declaration);
        self.add_request("textDocument/references", features::references);
        self.add_request("textDocument/documentSymbol", features::document_symbols);
        self.add_request("workspace/executeCommand", features::execute_command);

        self.add_notification("initialized", on_initialized);
        self.add_notification("exit", on_exit);
        self.add_notification("textDocument/didOpen", on_did_open);
        self.add_notification("textDocument/didChange", on_did_change);
        self.add_notification("textDocument/didSave", on_did_save);
        self.add_notification("textDocument/didClose", on_did_close);
        self.add_notification("workspace/didChangeConfiguration", on_did_change_configuration);
        self.add_notification("$/cancelRequest", on_cancel_request);
    }

    /// Which requests a lifecycle phase admits.
    fn admits(phase: Phase, method: &str) -> bool {
        match phase {
            Phase::Uninitialized => method == "initialize",
            Phase::Initializing => matches!(method, "shutdown"),
            Phase::Ready => true,
            Phase::ShutDown => false,
        }
    }

    pub async fn dispatch(&self, message: Message) {
        match message {
            Message::Request(request) => self.dispatch_request(request).await,
            Message::Notification(notification) => {
                if let Some(handler) = self.notifications.get(notification.method.as_str()) {
                    handler(self.ctx.clone(), notification.params).await;
                } else {
                    tracing::debug!(method = %notification.method, "unhandled notification");
                }
            }
            Message::Response(response) => match self.ctx.complete_request(&response.id) {
                Some(method) => tracing::debug!(%method, "client answered"),
                None => tracing::warn!(id = ?response.id, "response to unknown request"),
            },
        }
    }

    async fn dispatch_request(&self, request: Request) {
        let phase = self.ctx.world.lock().await.phase;
        if !Self::admits(phase, &request.method) {
            let (code, message) = match phase {
                Phase::Uninitialized | Phase::Initializing => (
                    error_codes::SERVER_NOT_INITIALIZED,
                    "server is not initialized".to_owned(),
                ),
                _ => (error_codes::INVALID_REQUEST, "server is shutting down".to_owned()),
            };
            self.ctx.send(Message::Response(Response::err(request.id, code, message)));
            return;
        }
        let Some(handler) = self.requests.get(request.method.as_str()) else {
            self.ctx.send(Message::Response(Response::err(
                request.id,
                error_codes::METHOD_NOT_FOUND,
                format!("method not found: {}", request.method),
            )));
            return;
        };

        let future = handler(self.ctx.clone(), request.params);
        let ctx = self.ctx.clone();
        let id = request.id;
        tokio::spawn(async move {
            let response = match future.await {
                Ok(result) => Response::ok(id, result),
                Err(error) => Response { id, result: None, error: Some(error) },
            };
            ctx.send(Message::Response(response));
        });
    }

    /// Drive a full connection: read frames, dispatch, write responses.
    /// Returns the process exit code: 0 after an orderly
    /// shutdown-then-exit, 1 otherwise.
    pub async fn run<R, W>(mut self, reader: R, writer: W) -> i32
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut outgoing_rx = self.outgoing_rx.take().expect("server can only run once");
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(error) = write_message(&mut writer, &message).await {
                    tracing::error!(%error, "failed to write to client");
                    break;
                }
            }
        });

        tokio::spawn(indexer::run(self.ctx.clone()));

        let mut exit = self.ctx.exit_signal();
        let mut reader = BufReader::new(reader);
        loop {
            tokio::select! {
                message = read_message(&mut reader) => match message {
                    Ok(Some(message)) => self.dispatch(message).await,
                    Ok(None) => {
                        tracing::info!("client closed the connection");
                        break;
                    }
                    Err(error) => {
                        tracing::error!(%error, "transport error");
                        break;
                    }
                },
                _ = async {
                    loop {
                        if *exit.borrow() {
                            return;
                        }
                        if exit.changed().await.is_err() {
                            return;
                        }
                    }
                } => break,
            }
        }

        let clean = self.ctx.shutdown_requested();
        drop(self);
        writer_task.abort();
        if clean {
            0
        } else {
            1
        }
    }
}

async fn on_initialize(
    ctx: Arc<ServerCtx>,
    params: InitializeParams,
) -> Result<Value, ResponseError> {
    let workspace = params
        .workspace_folders
        .as_ref()
        .and_then(|folders| folders.first())
        .and_then(|folder| proto::uri_to_path(&folder.uri))
        .or_else(|| {
            #[allow(deprecated)]
            let root = params.root_uri.as_ref();
            root.and_then(proto::uri_to_path)
        })
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    let encoding = params
        .capabilities
        .general
        .as_ref()
        .and_then(|general| general.position_encodings.as_deref())
        .map(PositionEncoding::negotiate)
        .unwrap_or_default();

    let mut config = Config::load_or_default(&workspace);
    config.substitute_workspace(&workspace);

    {
        let mut world = ctx.world.lock().await;
        if world.phase != Phase::Uninitialized {
            return Err(ResponseError {
                code: error_codes::INVALID_REQUEST,
                message: "server is already initialized".to_owned(),
            });
        }
        world.workspace = workspace.clone();
        world.encoding = encoding;
        world.db.set_workspace(&workspace);
        world.db.load_rules(&config.rules);
        world.open_files.set_capacity(config.server.max_active_files);
        ctx.store.set_dir(Some(PathBuf::from(&config.index.dir)));

        let dirs = config.server.compile_commands_dirs.clone();
        world.db.load_compile_database(&dirs, &workspace);
        world.config = config;
        world.phase = Phase::Initializing;
    }

    ctx.plugins.fire(Hook::Initialize).await;

    let capabilities = ServerCapabilities {
        position_encoding: Some(encoding.kind()),
        text_document_sync: Some(TextDocumentSyncCapability::Kind(
            TextDocumentSyncKind::INCREMENTAL,
        )),
        definition_provider: Some(OneOf::Left(true)),
        declaration_provider: Some(DeclarationCapability::Simple(true)),
        references_provider: Some(OneOf::Left(true)),
        document_symbol_provider: Some(OneOf::Left(true)),
        execute_command_provider: Some(ExecuteCommandOptions {
            commands: ctx.plugins.command_names(),
            work_done_progress_options: Default::default(),
        }),
        ..ServerCapabilities::default()
    };
    let result = InitializeResult {
        capabilities,
        server_info: Some(ServerInfo {
            name: "cppls".to_owned(),
            version: Some(env!("CARGO_PKG_VERSION").to_owned()),
        }),
    };
    serde_json::to_value(result).map_err(|e| ResponseError {
        code: error_codes::INTERNAL_ERROR,
        message: e.to_string(),
    })
}

async fn on_initialized(ctx: Arc<ServerCtx>, _params: lsp_types::InitializedParams) {
    {
        let mut world = ctx.world.lock().await;
        world.phase = Phase::Ready;
    }
    ctx.plugins.fire(Hook::Initialized).await;
    indexer::schedule_project(&ctx).await;
}

async fn on_shutdown(ctx: Arc<ServerCtx>, _params: Option<Value>) -> Result<Value, ResponseError> {
    {
        let mut world = ctx.world.lock().await;
        world.phase = Phase::ShutDown;
        world.open_files.cancel_all();
    }
    ctx.indexer.cancel_all();
    ctx.request_shutdown();
    ctx.plugins.fire(Hook::Shutdown).await;
    Ok(Value::Null)
}

async fn on_exit(ctx: Arc<ServerCtx>, _params: Option<Value>) {
    ctx.plugins.fire(Hook::Exit).await;
    ctx.trigger_exit();
}

async fn on_did_open(ctx: Arc<ServerCtx>, params: DidOpenTextDocumentParams) {
    let Some(path) = proto::uri_to_path(&params.text_document.uri) else { return };
    tracing::info!(path = %path.display(), "document opened");
    scheduler::on_change(
        ctx,
        path,
        params.text_document.text,
        params.text_document.version,
    )
    .await;
}

async fn on_did_change(ctx: Arc<ServerCtx>, params: DidChangeTextDocumentParams) {
    let Some(path) = proto::uri_to_path(&params.text_document.uri) else { return };
    let (mut content, encoding) = {
        let world = ctx.world.lock().await;
        let Some(entry) = world.open_files.peek(&path) else {
            tracing::warn!(path = %path.display(), "change for unopened document");
            return;
        };
        ((*entry.content).clone(), world.encoding)
    };

    for change in params.content_changes {
        match change.range {
            None => content = change.text,
            Some(range) => {
                let begin = proto::position_to_offset(&content, range.start, encoding) as usize;
                let end = proto::position_to_offset(&content, range.end, encoding) as usize;
                content.replace_range(begin..end, &change.text);
            }
        }
    }

    scheduler::on_change(ctx, path, content, params.text_document.version).await;
}

async fn on_did_save(ctx: Arc<ServerCtx>, params: DidSaveTextDocumentParams) {
    let Some(path) = proto::uri_to_path(&params.text_document.uri) else { return };
    // Once the save has landed on disk, the background index (built from
    // disk) is stale relative to it; re-index the file.
    let save_landed = {
        let world = ctx.world.lock().await;
        match world.open_files.peek(&path) {
            Some(entry) => std::fs::read_to_string(&path)
                .map(|disk| disk == *entry.content)
                .unwrap_or(false),
            None => false,
        }
    };
    if save_landed {
        ctx.indexer.enqueue(path.to_string_lossy().into_owned());
    }
}

async fn on_did_close(ctx: Arc<ServerCtx>, params: DidCloseTextDocumentParams) {
    let Some(path) = proto::uri_to_path(&params.text_document.uri) else { return };
    tracing::info!(path = %path.display(), "document closed");
    scheduler::on_close(&ctx, &path).await;
    if let Some(uri) = proto::path_to_uri(&path) {
        let params = lsp_types::PublishDiagnosticsParams {
            uri,
            diagnostics: Vec::new(),
            version: None,
        };
        ctx.send_notification(
            "textDocument/publishDiagnostics",
            serde_json::to_value(params).expect("diagnostics serialize"),
        );
    }
}

async fn on_did_change_configuration(
    ctx: Arc<ServerCtx>,
    _params: lsp_types::DidChangeConfigurationParams,
) {
    ctx.plugins.fire(Hook::DidChangeConfiguration).await;
}

async fn on_cancel_request(_ctx: Arc<ServerCtx>, params: Value) {
    tracing::debug!(?params, "client cancelled a request");
}
