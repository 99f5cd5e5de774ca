use std::{future::Future, sync::Arc};

use async_trait::async_trait;

use super::message::Message;

/// Receives messages delivered to an address.
///
/// Handlers run on the registration's own worker task, one message at a time.
/// Returning `Err` (or panicking) is reported to the router's error sink and,
/// for requests that have not been answered yet, fails the request.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> anyhow::Result<()>;
}

pub type BoxedHandler = Arc<dyn MessageHandler>;

#[async_trait]
impl<H> MessageHandler for Arc<H>
where
    H: MessageHandler + ?Sized,
{
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        (**self).handle(message).await
    }
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        (self.0)(message).await
    }
}

/// Adapter turning a synchronous closure into a [`MessageHandler`].
pub struct SyncHandler<F>(F);

#[async_trait]
impl<F> MessageHandler for SyncHandler<F>
where
    F: Fn(Message) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        (self.0)(message)
    }
}

/// ```rust,no_run
/// # use busline::event::{handler_fn, AddressRouter};
/// # async fn example(router: AddressRouter) {
/// router.subscribe(
///     "example.address",
///     handler_fn(|message| async move {
///         message.reply(format!("{} is processed", message.body()));
///         Ok(())
///     }),
/// );
/// # }
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler(f)
}

pub fn sync_handler<F>(f: F) -> SyncHandler<F>
where
    F: Fn(Message) -> anyhow::Result<()> + Send + Sync,
{
    SyncHandler(f)
}
