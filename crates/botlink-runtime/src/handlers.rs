//! Application Handlers
//!
//! Handlers are registered once at startup and invoked by the dispatcher for each
//! inbound event of the kind they were registered for. Message handlers may return one
//! reply, which the dispatcher submits to the transport.

use std::{collections::HashMap, fmt, sync::Arc};

use botlink_core::{EventKind, InboundEvent, IncomingMessage, OutboundReply};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Handler Error
// ----------------------------------------------------------------------------

/// Error returned by an application handler
///
/// Logged and counted by the dispatcher; never ends the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

// ----------------------------------------------------------------------------
// Handler Traits
// ----------------------------------------------------------------------------

/// Handles conversation messages
pub trait MessageHandler: Send + Sync {
    /// Process one message, optionally producing a reply
    fn handle(&self, message: &IncomingMessage) -> Result<Option<OutboundReply>, HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&IncomingMessage) -> Result<Option<OutboundReply>, HandlerError> + Send + Sync,
{
    fn handle(&self, message: &IncomingMessage) -> Result<Option<OutboundReply>, HandlerError> {
        self(message)
    }
}

/// Handles non-message events (connected, pairing code, unknown, ...)
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &InboundEvent) -> Result<(), HandlerError>;
}

impl<F> EventHandler for F
where
    F: Fn(&InboundEvent) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, event: &InboundEvent) -> Result<(), HandlerError> {
        self(event)
    }
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// Routing table from event kind to handler, fixed once the runtime starts
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    message: Option<Arc<dyn MessageHandler>>,
    events: HashMap<EventKind, Arc<dyn EventHandler>>,
}

/// Resolved route for one event
pub enum Route<'a> {
    Message(&'a IncomingMessage, &'a Arc<dyn MessageHandler>),
    Event(&'a Arc<dyn EventHandler>),
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the message handler, replacing any previous one
    pub fn set_message_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        self.message = Some(handler);
    }

    /// Install a handler for a non-message event kind
    ///
    /// Registrations for [`EventKind::Message`] are ignored; messages always route to
    /// the message handler.
    pub fn set_event_handler(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        if kind == EventKind::Message {
            tracing::warn!("Ignoring event handler registered for message events; use on_message");
            return;
        }
        self.events.insert(kind, handler);
    }

    /// Find the handler for `event`, if any was registered
    pub fn route<'a>(&'a self, event: &'a InboundEvent) -> Option<Route<'a>> {
        match event {
            InboundEvent::Message(message) => self
                .message
                .as_ref()
                .map(|handler| Route::Message(message, handler)),
            other => self.events.get(&other.kind()).map(Route::Event),
        }
    }

    pub fn has_message_handler(&self) -> bool {
        self.message.is_some()
    }

    /// Kinds with a registered handler, for startup logging
    pub fn registered_kinds(&self) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = self.events.keys().copied().collect();
        if self.message.is_some() {
            kinds.push(EventKind::Message);
        }
        kinds.sort_by_key(|kind| kind.as_str());
        kinds
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.registered_kinds())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Echo Handler
// ----------------------------------------------------------------------------

/// Replies `Received: <body>` to the originating conversation
#[derive(Debug, Clone, Default)]
pub struct EchoHandler;

impl EchoHandler {
    pub fn new() -> Self {
        Self
    }
}

impl MessageHandler for EchoHandler {
    fn handle(&self, message: &IncomingMessage) -> Result<Option<OutboundReply>, HandlerError> {
        Ok(Some(OutboundReply::text(
            message.chat.clone(),
            format!("Received: {}", message.body),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botlink_core::{ChatId, ReplyPayload};

    fn message(body: &str) -> IncomingMessage {
        IncomingMessage::new("m1", ChatId::new("C"), "alice", body)
    }

    #[test]
    fn test_echo_replies_to_originating_chat() {
        let reply = EchoHandler::new().handle(&message("hello")).unwrap().unwrap();
        assert_eq!(reply.recipient, ChatId::new("C"));
        assert_eq!(reply.payload, ReplyPayload::Text("Received: hello".to_string()));
    }

    #[test]
    fn test_routing_by_kind() {
        let mut registry = HandlerRegistry::new();
        let event = InboundEvent::Message(message("hi"));
        assert!(registry.route(&event).is_none());

        registry.set_message_handler(Arc::new(EchoHandler::new()));
        assert!(matches!(registry.route(&event), Some(Route::Message(..))));

        let connected = InboundEvent::Connected { identity: None };
        assert!(registry.route(&connected).is_none());

        registry.set_event_handler(
            EventKind::Connected,
            Arc::new(|_: &InboundEvent| -> Result<(), HandlerError> { Ok(()) }),
        );
        assert!(matches!(registry.route(&connected), Some(Route::Event(_))));

        let unknown = InboundEvent::Unknown {
            kind: "presence".to_string(),
        };
        assert!(registry.route(&unknown).is_none());
        assert_eq!(
            registry.registered_kinds(),
            vec![EventKind::Connected, EventKind::Message]
        );
    }

    #[test]
    fn test_event_handler_for_message_kind_ignored() {
        let mut registry = HandlerRegistry::new();
        registry.set_event_handler(
            EventKind::Message,
            Arc::new(|_: &InboundEvent| -> Result<(), HandlerError> { Ok(()) }),
        );
        assert!(registry.registered_kinds().is_empty());
    }

    #[test]
    fn test_closure_handlers() {
        let handler = |msg: &IncomingMessage| -> Result<Option<OutboundReply>, HandlerError> {
            if msg.body.is_empty() {
                Err("empty body".into())
            } else {
                Ok(None)
            }
        };
        assert_eq!(
            MessageHandler::handle(&handler, &message(""))
                .unwrap_err()
                .message(),
            "empty body"
        );
        assert_eq!(MessageHandler::handle(&handler, &message("x")).unwrap(), None);
    }
}
