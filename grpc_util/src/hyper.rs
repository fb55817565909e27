// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use hyper::server::accept::Accept;
use hyper::server::conn::{AddrIncoming, AddrStream};

/// Adapts hyper's `AddrIncoming` (which implements `Accept`) into a `Stream` of connections
/// as expected by `tonic::transport::Server::serve_with_incoming_shutdown`.
pub struct AddrIncomingWithStream(pub AddrIncoming);

impl AddrIncomingWithStream {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.0.local_addr()
    }
}

impl Stream for AddrIncomingWithStream {
    type Item = Result<AddrStream, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.0).poll_accept(cx)
    }
}
