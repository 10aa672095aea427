use std::{pin::Pin, sync::Arc, time::Duration};

use rama::{error::BoxError, telemetry::tracing};
use tokio::sync::mpsc;

use super::AnalysisResult;

/// How long a producer waits to get a request into the broker queue.
pub const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a producer waits for the user's answer.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(300);

/// A pending interactive confirmation.
///
/// The response channel has capacity 1; the broker sends exactly one boolean
/// and drops its sender afterwards, so a reading producer either receives the
/// answer or observes the channel closing.
pub struct ConfirmationRequest {
    pub result: Arc<AnalysisResult>,
    pub response_tx: mpsc::Sender<bool>,
}

/// Errors a producer can observe while asking for confirmation.
#[derive(Debug, thiserror::Error)]
pub enum ConfirmError {
    #[error("confirmation broker queue is full or closed")]
    Enqueue,
    #[error("timed out waiting for the user's answer")]
    ResponseTimeout,
    #[error("confirmation broker dropped the request")]
    Closed,
}

/// Producer handle to the confirmation broker. Cheaply cloneable; any number
/// of concurrent analyses may funnel prompts through the single consumer.
#[derive(Clone)]
pub struct ConfirmationSender {
    tx: mpsc::Sender<ConfirmationRequest>,
}

impl std::fmt::Debug for ConfirmationSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationSender").finish()
    }
}

impl ConfirmationSender {
    /// Enqueue a prompt and wait for the user's boolean answer, bounded by
    /// [`ENQUEUE_TIMEOUT`] and [`RESPONSE_TIMEOUT`]. Callers treat any error
    /// as a declined confirmation.
    pub async fn request_confirmation(
        &self,
        result: Arc<AnalysisResult>,
    ) -> Result<bool, ConfirmError> {
        self.request_confirmation_with_timeouts(result, ENQUEUE_TIMEOUT, RESPONSE_TIMEOUT)
            .await
    }

    pub async fn request_confirmation_with_timeouts(
        &self,
        result: Arc<AnalysisResult>,
        enqueue_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<bool, ConfirmError> {
        let (response_tx, mut response_rx) = mpsc::channel(1);

        self.tx
            .send_timeout(
                ConfirmationRequest {
                    result,
                    response_tx,
                },
                enqueue_timeout,
            )
            .await
            .map_err(|_| ConfirmError::Enqueue)?;

        match tokio::time::timeout(response_timeout, response_rx.recv()).await {
            Ok(Some(answer)) => Ok(answer),
            Ok(None) => Err(ConfirmError::Closed),
            Err(_) => Err(ConfirmError::ResponseTimeout),
        }
    }
}

/// The interactive prompt the broker drives, typically a terminal dialog.
pub trait ConfirmationPrompt: Send + Sync + 'static {
    fn confirm(
        &self,
        result: &AnalysisResult,
    ) -> impl Future<Output = Result<bool, BoxError>> + Send + '_;

    fn into_dyn(self) -> DynConfirmationPrompt
    where
        Self: Sized,
    {
        DynConfirmationPrompt {
            inner: Arc::new(self),
        }
    }
}

trait DynConfirmationPromptInner {
    fn dyn_confirm<'a>(
        &'a self,
        result: &'a AnalysisResult,
    ) -> Pin<Box<dyn Future<Output = Result<bool, BoxError>> + Send + 'a>>;
}

impl<P: ConfirmationPrompt> DynConfirmationPromptInner for P {
    #[inline(always)]
    fn dyn_confirm<'a>(
        &'a self,
        result: &'a AnalysisResult,
    ) -> Pin<Box<dyn Future<Output = Result<bool, BoxError>> + Send + 'a>> {
        Box::pin(self.confirm(result))
    }
}

/// A dyn-patched [`ConfirmationPrompt`].
pub struct DynConfirmationPrompt {
    inner: Arc<dyn DynConfirmationPromptInner + Send + Sync + 'static>,
}

impl Clone for DynConfirmationPrompt {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for DynConfirmationPrompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynConfirmationPrompt").finish()
    }
}

impl ConfirmationPrompt for DynConfirmationPrompt {
    #[inline(always)]
    fn confirm(
        &self,
        result: &AnalysisResult,
    ) -> impl Future<Output = Result<bool, BoxError>> + Send + '_ {
        self.inner.dyn_confirm(result)
    }

    #[inline(always)]
    fn into_dyn(self) -> DynConfirmationPrompt {
        self
    }
}

/// Hooks fired around each interaction, e.g. to pause and restore a spinner.
/// Hook errors are logged and never fail the prompt.
pub trait InteractionHooks: Send + Sync + 'static {
    fn before_interaction(&self) -> Result<(), BoxError> {
        Ok(())
    }

    fn after_interaction(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// The default no-op hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl InteractionHooks for NoHooks {}

/// Single consumer serializing interactive prompts: the user answers at most
/// one question at a time, in enqueue order. Exits when every sender is gone.
pub struct ConfirmationBroker {
    rx: mpsc::Receiver<ConfirmationRequest>,
    prompt: DynConfirmationPrompt,
    hooks: Box<dyn InteractionHooks>,
}

impl std::fmt::Debug for ConfirmationBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationBroker").finish()
    }
}

/// Create a broker queue with the given capacity.
pub fn confirmation_channel(capacity: usize) -> (ConfirmationSender, mpsc::Receiver<ConfirmationRequest>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ConfirmationSender { tx }, rx)
}

impl ConfirmationBroker {
    pub fn new(rx: mpsc::Receiver<ConfirmationRequest>, prompt: DynConfirmationPrompt) -> Self {
        Self {
            rx,
            prompt,
            hooks: Box::new(NoHooks),
        }
    }

    pub fn with_hooks(mut self, hooks: impl InteractionHooks) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    /// Spawn the broker onto the runtime and return the producer handle.
    pub fn spawn(prompt: DynConfirmationPrompt, capacity: usize) -> ConfirmationSender {
        let (sender, rx) = confirmation_channel(capacity);
        tokio::spawn(Self::new(rx, prompt).run());
        sender
    }

    pub async fn run(mut self) {
        while let Some(request) = self.rx.recv().await {
            if let Err(err) = self.hooks.before_interaction() {
                tracing::debug!("before-interaction hook failed: {err}");
            }

            let answer = match self.prompt.confirm(&request.result).await {
                Ok(answer) => answer,
                Err(err) => {
                    tracing::warn!(
                        package = %request.result.package,
                        "confirmation prompt failed, treating as declined: {err}"
                    );
                    false
                }
            };

            if let Err(err) = self.hooks.after_interaction() {
                tracing::debug!("after-interaction hook failed: {err}");
            }

            // The producer may have timed out and dropped its receiver
            // already; that is its decline to keep.
            if request.response_tx.try_send(answer).is_err() {
                tracing::debug!(
                    package = %request.result.package,
                    "confirmation answer had no receiver"
                );
            }
        }
        tracing::debug!("confirmation broker exiting: request channel closed");
    }
}
