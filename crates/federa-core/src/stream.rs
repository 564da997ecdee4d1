//! Typed node streams between filters
//!
//! A [`NodeStream`] is the consumer end of a bounded single-producer,
//! single-consumer channel of [`ListNodesResponse`] values. `send` waits for
//! capacity, so a slow consumer throttles the producer. Either side may close
//! early; a producer closes with an error by calling [`NodeSender::fail`].
//! Cancelling the bound token ends the stream with a `Cancelled` error.

use crate::{node::Node, CoreError, Result};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default channel capacity
pub const DEFAULT_STREAM_CAPACITY: usize = 32;

/// One item of a listing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListNodesResponse {
    pub node: Node,
}

impl From<Node> for ListNodesResponse {
    fn from(node: Node) -> Self {
        Self { node }
    }
}

/// Producer side of a node stream
pub struct NodeSender {
    tx: mpsc::Sender<Result<ListNodesResponse>>,
    cancel: CancellationToken,
}

impl NodeSender {
    /// Send one node, waiting for the consumer to make room.
    ///
    /// Fails with `Cancelled` when the request is cancelled or the consumer
    /// has gone away; producers should stop on error.
    pub async fn send(&self, node: Node) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CoreError::Cancelled),
            sent = self.tx.send(Ok(ListNodesResponse { node })) => sent.map_err(|_| CoreError::Cancelled),
        }
    }

    /// Close the stream with an error the consumer will observe
    pub async fn fail(self, err: CoreError) {
        let _ = self.tx.send(Err(err)).await;
    }

    /// Close the stream normally
    pub fn close(self) {}

    /// True once the consumer has dropped or closed its end
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of a node stream
pub struct NodeStream {
    inner: BoxStream<'static, Result<ListNodesResponse>>,
}

/// Create a bounded node channel bound to a cancellation token
pub fn node_channel(capacity: usize, cancel: CancellationToken) -> (NodeSender, NodeStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    // a cancelled request yields one `Cancelled` error, then ends
    let inner = stream::unfold(Some((rx, cancel.clone())), |state| async move {
        let (mut rx, token) = state?;
        tokio::select! {
            biased;
            _ = token.cancelled() => Some((Err(CoreError::Cancelled), None)),
            item = rx.recv() => item.map(|item| (item, Some((rx, token)))),
        }
    })
    .boxed();
    (NodeSender { tx, cancel }, NodeStream { inner })
}

impl NodeStream {
    /// A stream that ends immediately
    pub fn empty() -> Self {
        Self {
            inner: stream::empty().boxed(),
        }
    }

    /// A stream over already materialised nodes
    pub fn from_nodes(nodes: Vec<Node>) -> Self {
        Self {
            inner: stream::iter(nodes.into_iter().map(|node| Ok(ListNodesResponse { node }))).boxed(),
        }
    }

    /// A stream yielding one error
    pub fn from_error(err: CoreError) -> Self {
        Self {
            inner: stream::once(async move { Err(err) }).boxed(),
        }
    }

    /// Receive the next item; `None` is end-of-stream
    pub async fn recv(&mut self) -> Option<Result<ListNodesResponse>> {
        self.inner.next().await
    }

    /// Stop consuming; later `recv` calls return end-of-stream and the
    /// producer's next `send` fails.
    pub fn close(&mut self) {
        self.inner = stream::empty().boxed();
    }

    /// Lazily rewrite every node; `None` drops the node from the stream
    pub fn map_nodes<F>(self, mut f: F) -> Self
    where
        F: FnMut(Node) -> Option<Node> + Send + 'static,
    {
        let inner = self
            .inner
            .filter_map(move |item| {
                let mapped = match item {
                    Ok(resp) => f(resp.node).map(|node| Ok(ListNodesResponse { node })),
                    Err(e) => Some(Err(e)),
                };
                futures::future::ready(mapped)
            })
            .boxed();
        Self { inner }
    }

    /// Drain into a vector, stopping at the first error
    pub async fn collect_nodes(mut self) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        while let Some(item) = self.recv().await {
            nodes.push(item?.node);
        }
        Ok(nodes)
    }
}

impl Stream for NodeStream {
    type Item = Result<ListNodesResponse>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
