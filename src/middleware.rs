//! Middleware shapes and chain control.
//!
//! The framework accepts two middleware shapes as a sum type: ammo-style
//! steps see the full request context, classic-style steps see only the raw
//! request head and the response channel. Both advance the chain by returning
//! [`Flow::Continue`]; returning [`Flow::Halt`] or an error ends it.
//!
//! Step traits are blanket-implemented for async functions, so a plain
//! `async fn(Ammo) -> Result<Flow, HttpError>` registers directly.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::ammo::{Ammo, RequestInfo, Responder};
use crate::error::HttpError;

/// Chain control returned by every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Hand over to the next step.
    Continue,
    /// Stop the chain. A halting step must have sent a response; the
    /// dispatcher converts a silent halt into a 500.
    Halt,
}

pub type StepResult = Result<Flow, HttpError>;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A step that receives the full request context.
pub trait AmmoStep: Send + Sync + 'static {
    fn call(&self, ammo: Ammo) -> BoxFuture<StepResult>;
}

impl<F, Fut> AmmoStep for F
where
    F: Fn(Ammo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    fn call(&self, ammo: Ammo) -> BoxFuture<StepResult> {
        Box::pin(self(ammo))
    }
}

/// A step that receives the raw request head and the response channel.
pub trait ClassicStep: Send + Sync + 'static {
    fn call(&self, info: Arc<RequestInfo>, responder: Responder) -> BoxFuture<StepResult>;
}

impl<F, Fut> ClassicStep for F
where
    F: Fn(Arc<RequestInfo>, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    fn call(&self, info: Arc<RequestInfo>, responder: Responder) -> BoxFuture<StepResult> {
        Box::pin(self(info, responder))
    }
}

/// One registered middleware, in either shape.
#[derive(Clone)]
pub enum Middleware {
    Ammo(Arc<dyn AmmoStep>),
    Classic(Arc<dyn ClassicStep>),
}

impl Middleware {
    pub fn ammo(step: impl AmmoStep) -> Self {
        Middleware::Ammo(Arc::new(step))
    }

    pub fn classic(step: impl ClassicStep) -> Self {
        Middleware::Classic(Arc::new(step))
    }

    pub(crate) async fn run(&self, ammo: &Ammo) -> StepResult {
        match self {
            Middleware::Ammo(step) => step.call(ammo.clone()).await,
            Middleware::Classic(step) => {
                step.call(ammo.request().clone(), ammo.responder().clone()).await
            }
        }
    }
}

/// The terminal chain step.
#[derive(Clone)]
pub struct Handler(Arc<dyn AmmoStep>);

impl Handler {
    pub fn new(step: impl AmmoStep) -> Self {
        Self(Arc::new(step))
    }

    pub(crate) async fn run(&self, ammo: &Ammo) -> StepResult {
        self.0.call(ammo.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use serde_json::{json, Map};

    fn ammo() -> Ammo {
        Ammo::new(
            RequestInfo {
                method: Method::GET,
                path: "/".to_string(),
                endpoint: "/".to_string(),
                ip: "127.0.0.1".to_string(),
                protocol: "http".to_string(),
                hostname: "localhost".to_string(),
                full_url: "http://localhost/".to_string(),
                headers: vec![],
            },
            Map::new(),
        )
    }

    async fn pass(_ammo: Ammo) -> StepResult {
        Ok(Flow::Continue)
    }

    #[tokio::test]
    async fn test_ammo_step_from_async_fn() {
        let mw = Middleware::ammo(pass);
        assert_eq!(mw.run(&ammo()).await.unwrap(), Flow::Continue);
    }

    #[tokio::test]
    async fn test_ammo_step_from_closure() {
        let mw = Middleware::ammo(|ammo: Ammo| async move {
            ammo.set_field("seen", json!(true));
            Ok(Flow::Continue)
        });
        let a = ammo();
        mw.run(&a).await.unwrap();
        assert_eq!(a.field("seen"), Some(json!(true)));
    }

    #[tokio::test]
    async fn test_classic_step_sees_responder() {
        let mw = Middleware::classic(|info: Arc<RequestInfo>, responder: Responder| async move {
            responder.set_header("X-Path", info.endpoint.clone());
            Ok(Flow::Continue)
        });
        let a = ammo();
        mw.run(&a).await.unwrap();
        a.send(json!("done"));
        let reply = a.responder().take_reply().unwrap();
        assert_eq!(reply.headers, vec![("X-Path".to_string(), "/".to_string())]);
    }

    #[tokio::test]
    async fn test_handler_halts_with_response() {
        let handler = Handler::new(|ammo: Ammo| async move {
            ammo.send(json!("payload"));
            Ok(Flow::Halt)
        });
        let a = ammo();
        assert_eq!(handler.run(&a).await.unwrap(), Flow::Halt);
        assert!(a.sent());
    }

    #[tokio::test]
    async fn test_step_error_propagates() {
        let mw = Middleware::ammo(|_ammo: Ammo| async move {
            Err(HttpError::with_code(403))
        });
        let err = mw.run(&ammo()).await.unwrap_err();
        assert_eq!(err.resolve().0, 403);
    }
}
