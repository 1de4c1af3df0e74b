//! tower-lsp based Language Server implementation.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tower_lsp::jsonrpc::{Error, ErrorCode, Result};
use tower_lsp::lsp_types::notification::Notification as _;
use tower_lsp::lsp_types::request::Request as _;
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer, LspService, Server};
use tracing::{debug, warn};

use super::bridge::{Bridge, BridgeError, EditorSink};
use super::capabilities::server_capabilities;
use crate::airlock::SubscriptionEvent;

#[async_trait::async_trait]
impl EditorSink for Client {
    async fn notify(&self, method: &str, params: Value) -> anyhow::Result<()> {
        if method == notification::PublishDiagnostics::METHOD {
            let params: PublishDiagnosticsParams = serde_json::from_value(params)?;
            self.publish_diagnostics(params.uri, params.diagnostics, params.version)
                .await;
        } else if method == notification::ShowMessage::METHOD {
            let params: ShowMessageParams = serde_json::from_value(params)?;
            self.show_message(params.typ, params.message).await;
        } else if method == notification::LogMessage::METHOD {
            let params: LogMessageParams = serde_json::from_value(params)?;
            self.log_message(params.typ, params.message).await;
        } else {
            anyhow::bail!("unsupported notification: {method}");
        }
        Ok(())
    }
}

fn internal_error(message: impl Into<String>) -> Error {
    let message: String = message.into();
    Error {
        code: ErrorCode::InternalError,
        message: message.into(),
        data: None,
    }
}

/// Map a forwarding failure onto the JSON-RPC error the editor sees.
fn to_rpc_error(e: BridgeError) -> Error {
    match e {
        BridgeError::Remote(remote) => Error {
            code: ErrorCode::from(remote.code),
            message: remote.message.into(),
            data: remote.data,
        },
        other => internal_error(other.to_string()),
    }
}

pub struct Backend {
    bridge: Arc<Bridge>,
}

impl Backend {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        Self { bridge }
    }

    async fn forward<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> Result<Option<R>> {
        let params = serde_json::to_value(params).map_err(|e| internal_error(e.to_string()))?;
        let result = self
            .bridge
            .request(method, params)
            .await
            .map_err(to_rpc_error)?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|e| internal_error(format!("invalid {method} result from ship: {e}")))
    }

    /// Queues the notification without waiting on the ship, so handlers running
    /// concurrently still enqueue in the order the editor sent them.
    fn forward_notification<P: Serialize>(&self, method: &str, params: P) {
        match serde_json::to_value(params) {
            Ok(params) => self.bridge.notify(method, params),
            Err(e) => warn!(error = %e, method, "could not encode notification"),
        }
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, _: InitializeParams) -> Result<InitializeResult> {
        debug!(method = request::Initialize::METHOD, "answering locally");
        Ok(InitializeResult {
            capabilities: server_capabilities(),
            server_info: Some(ServerInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
        })
    }

    async fn initialized(&self, params: InitializedParams) {
        self.forward_notification(notification::Initialized::METHOD, params);
    }

    async fn shutdown(&self) -> Result<()> {
        self.bridge.close().await;
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        self.forward_notification(notification::DidOpenTextDocument::METHOD, params);
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        self.forward_notification(notification::DidChangeTextDocument::METHOD, params);
    }

    async fn will_save(&self, params: WillSaveTextDocumentParams) {
        self.forward_notification(notification::WillSaveTextDocument::METHOD, params);
    }

    async fn did_save(&self, params: DidSaveTextDocumentParams) {
        self.forward_notification(notification::DidSaveTextDocument::METHOD, params);
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        self.forward_notification(notification::DidCloseTextDocument::METHOD, params);
    }

    async fn did_change_workspace_folders(&self, params: DidChangeWorkspaceFoldersParams) {
        self.forward_notification(notification::DidChangeWorkspaceFolders::METHOD, params);
    }

    async fn did_change_configuration(&self, params: DidChangeConfigurationParams) {
        self.forward_notification(notification::DidChangeConfiguration::METHOD, params);
    }

    async fn hover(&self, params: HoverParams) -> Result<Option<Hover>> {
        self.forward(request::HoverRequest::METHOD, params).await
    }

    async fn goto_definition(
        &self,
        params: GotoDefinitionParams,
    ) -> Result<Option<GotoDefinitionResponse>> {
        self.forward(request::GotoDefinition::METHOD, params).await
    }

    async fn completion(&self, params: CompletionParams) -> Result<Option<CompletionResponse>> {
        self.forward(request::Completion::METHOD, params).await
    }
}

/// Messages tower-lsp handles at once. Requests can wait on the ship for up
/// to the request timeout; notifications only queue.
const MAX_CONCURRENT_MESSAGES: usize = 64;

/// Serve LSP over `input`/`output`, routing `updates` from the agent to the editor.
pub async fn serve<I, O>(
    input: I,
    output: O,
    bridge: Arc<Bridge>,
    updates: mpsc::UnboundedReceiver<SubscriptionEvent>,
) where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let (service, socket) = LspService::new(|client| {
        let editor: Arc<dyn EditorSink> = Arc::new(client);
        tokio::spawn(Arc::clone(&bridge).pump(updates, editor));
        Backend::new(bridge)
    });
    Server::new(input, output, socket)
        .concurrency_level(MAX_CONCURRENT_MESSAGES)
        .serve(service)
        .await;
}

/// Start the LSP server on stdio.
pub async fn serve_stdio(
    bridge: Arc<Bridge>,
    updates: mpsc::UnboundedReceiver<SubscriptionEvent>,
) {
    serve(tokio::io::stdin(), tokio::io::stdout(), bridge, updates).await;
}
