//! Update service adapter
//!
//! The update transport accepts firmware images over the network and calls
//! back into [`UpdateHooks`] as a transfer starts, progresses, ends or
//! fails. This adapter reports those events and tracks the session they
//! describe. It never cancels anything else the scheduler is doing.

use crate::console::Console;
use crate::{BoardError, diag};

/// What an update writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateTarget {
    /// Application firmware image
    Application,
    /// Filesystem image
    Filesystem,
}

impl UpdateTarget {
    pub fn label(self) -> &'static str {
        match self {
            UpdateTarget::Application => "sketch",
            UpdateTarget::Filesystem => "filesystem",
        }
    }
}

/// Failure causes reported by the update transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateError {
    Auth,
    Begin,
    Connect,
    Receive,
    End,
}

impl UpdateError {
    pub fn code(self) -> u8 {
        match self {
            UpdateError::Auth => 0,
            UpdateError::Begin => 1,
            UpdateError::Connect => 2,
            UpdateError::Receive => 3,
            UpdateError::End => 4,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            UpdateError::Auth => "Auth Failed",
            UpdateError::Begin => "Begin Failed",
            UpdateError::Connect => "Connect Failed",
            UpdateError::Receive => "Receive Failed",
            UpdateError::End => "End Failed",
        }
    }
}

impl From<UpdateError> for BoardError {
    fn from(_: UpdateError) -> Self {
        BoardError::UpdateError
    }
}

/// An update in progress, as observed through the hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateSession {
    pub target: UpdateTarget,
    pub transferred: u32,
    pub total: u32,
}

/// Lifecycle hooks invoked synchronously by the update transport
pub trait UpdateHooks {
    fn on_start(&mut self, target: UpdateTarget);
    fn on_progress(&mut self, transferred: u32, total: u32);
    fn on_end(&mut self);
    fn on_error(&mut self, error: UpdateError);
}

/// Update transport collaborator
#[allow(async_fn_in_trait)]
pub trait UpdateTransport {
    /// Start listening for update requests. Needs a bound address.
    async fn begin(&mut self);

    /// Accept a new request or advance the current one. Must return promptly.
    async fn handle<H: UpdateHooks>(&mut self, hooks: &mut H);
}

/// An absent transport never starts or reports anything
impl<U: UpdateTransport> UpdateTransport for Option<U> {
    async fn begin(&mut self) {
        if let Some(transport) = self {
            transport.begin().await;
        }
    }

    async fn handle<H: UpdateHooks>(&mut self, hooks: &mut H) {
        if let Some(transport) = self {
            transport.handle(hooks).await;
        }
    }
}

/// Hook implementation that writes diagnostics and tracks the session
pub struct UpdateReporter<'a, C> {
    console: &'a mut C,
    session: &'a mut Option<UpdateSession>,
}

impl<'a, C: Console> UpdateReporter<'a, C> {
    pub fn new(console: &'a mut C, session: &'a mut Option<UpdateSession>) -> Self {
        Self { console, session }
    }
}

impl<C: Console> UpdateHooks for UpdateReporter<'_, C> {
    fn on_start(&mut self, target: UpdateTarget) {
        *self.session = Some(UpdateSession {
            target,
            transferred: 0,
            total: 0,
        });
        diag!(self.console, "[OTA] Start updating {}", target.label());
    }

    fn on_progress(&mut self, transferred: u32, total: u32) {
        if let Some(session) = self.session.as_mut() {
            session.transferred = transferred;
            session.total = total;
        }

        if total == 0 {
            diag!(self.console, "[OTA] Progress: {} bytes", transferred);
        } else {
            let percent = u64::from(transferred) * 100 / u64::from(total);
            diag!(self.console, "[OTA] Progress: {}%", percent);
        }
    }

    fn on_end(&mut self) {
        *self.session = None;
        diag!(self.console, "[OTA] End");
    }

    fn on_error(&mut self, error: UpdateError) {
        *self.session = None;
        diag!(self.console, "[OTA] Error[{}]: {}", error.code(), error.message());
    }
}

/// Owns the update transport and the session it reports
pub struct UpdateService<U> {
    transport: U,
    session: Option<UpdateSession>,
}

impl<U: UpdateTransport> UpdateService<U> {
    pub fn new(transport: U) -> Self {
        Self {
            transport,
            session: None,
        }
    }

    pub fn transport(&self) -> &U {
        &self.transport
    }

    /// The update currently in progress, if any
    pub fn session(&self) -> Option<UpdateSession> {
        self.session
    }

    pub async fn begin<C: Console>(&mut self, console: &mut C) {
        self.transport.begin().await;
        diag!(console, "[OTA] Update service ready");
    }

    /// Give the transport one chance to make progress
    pub async fn poll<C: Console>(&mut self, console: &mut C) {
        let mut reporter = UpdateReporter::new(console, &mut self.session);
        self.transport.handle(&mut reporter).await;
    }
}
