use std::collections::HashMap;

use crate::control::bus::LinkId;
use crate::control::command::{Command, CommandKind};

/// A participant in the control protocol (supervisor or worker agent).
pub trait Side {
    /// The side's built-in handling of `command`, installed with [`Dispatcher::def`].
    fn handle_default(&mut self, from: LinkId, command: Command);
}

pub type Handler<S> = Box<dyn Fn(&mut S, LinkId, Command) + Send + Sync>;

/// Static dispatch table from command kind to handler.
///
/// Kinds without a handler are ignored by [`Dispatcher::dispatch`], which is how each
/// bus limits the commands it accepts.
pub struct Dispatcher<S> {
    handlers: HashMap<CommandKind, Handler<S>>,
}

impl<S> Default for Dispatcher<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S> Dispatcher<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler` for `kind`, replacing any previous one.
    pub fn on<F>(&mut self, kind: CommandKind, handler: F) -> &mut Self
    where
        F: Fn(&mut S, LinkId, Command) + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Box::new(handler));
        self
    }

    pub fn handles(&self, kind: CommandKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Run the handler for `command`. Returns false if none is installed.
    pub fn dispatch(&self, side: &mut S, from: LinkId, command: Command) -> bool {
        match self.handlers.get(&command.kind()) {
            Some(handler) => {
                handler(side, from, command);
                true
            }
            None => false,
        }
    }
}

impl<S: Side + 'static> Dispatcher<S> {
    /// Install the side's default handler for `kind`.
    pub fn def(&mut self, kind: CommandKind) -> &mut Self {
        self.on(kind, |side: &mut S, from, command| side.handle_default(from, command))
    }
}
