//! Handler traits.
//!
//! Two layers, same as every registry in this crate:
//! - `Handler`: typed input/output, what business code implements
//! - `DynHandler`: object-safe, JSON in and out, what the engine stores
//!
//! `TypedHandler<H>` erases the types; `handler_fn` turns an async closure
//! into a `Handler`.
//!
//! # 学習ポイント
//! - ジェネリック trait (`Handler`) と object-safe trait (`DynHandler`) の二層構造
//! - Type erasure: `TypedHandler<H>` が JSON の decode/encode を肩代わりする
//! - decode に失敗した入力は再試行しても直らないので terminal エラー (400) になる

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::codec;
use crate::app::Context;
use crate::domain::HandlerError;

/// Business code run by the engine.
///
/// ```ignore
/// struct Deposit;
///
/// #[async_trait]
/// impl Handler for Deposit {
///     type Input = u64;
///     type Output = ();
///
///     async fn handle(&self, ctx: Context, cents: u64) -> Result<(), HandlerError> {
///         let balance: u64 = ctx.get_state("balance")?.unwrap_or(100_000);
///         ctx.set_state("balance", &(balance + cents))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    type Input: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    async fn handle(&self, ctx: Context, input: Self::Input)
    -> Result<Self::Output, HandlerError>;
}

/// Object-safe handler, stored as `Arc<dyn DynHandler>`.
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        ctx: Context,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError>;
}

pub struct TypedHandler<H> {
    handler: H,
}

impl<H: Handler> TypedHandler<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<H: Handler> DynHandler for TypedHandler<H> {
    async fn handle_dyn(
        &self,
        ctx: Context,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        let input: H::Input = codec::decode("input", input)?;
        let output = self.handler.handle(ctx, input).await?;
        codec::encode("output", &output)
    }
}

/// Handler backed by an async closure.
pub struct FnHandler<F, I, O, Fut> {
    f: F,
    _marker: PhantomData<fn(I) -> (O, Fut)>,
}

/// Wrap `|ctx, input| async move { ... }` as a handler.
pub fn handler_fn<F, I, O, Fut>(f: F) -> FnHandler<F, I, O, Fut>
where
    F: Fn(Context, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, HandlerError>> + Send + 'static,
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, I, O, Fut> Handler for FnHandler<F, I, O, Fut>
where
    F: Fn(Context, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, HandlerError>> + Send + 'static,
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
{
    type Input = I;
    type Output = O;

    async fn handle(&self, ctx: Context, input: I) -> Result<O, HandlerError> {
        (self.f)(ctx, input).await
    }
}
