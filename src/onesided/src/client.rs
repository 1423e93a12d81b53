//! The active side: connect, write the payload into the server's buffer, read it back, compare.
use std::net::SocketAddr;

use rdma::ibv::AccessFlags;
use rdma::mr::MemoryRegion;
use rdma::rdmacm::{CmId, EventChannel};

use crate::cm::ActiveConnector;
use crate::config::Config;
use crate::descriptor::DESCRIPTOR_LEN;
use crate::error::{Error, Result};
use crate::exchange::{exchange_with_server, pre_post_descriptor_recv};
use crate::memory::{self, AllocatedRegion, LocalRegion};
use crate::ops::{verify, write_then_read};
use crate::resources::{teardown_client, ConnectionContext};

/// Run one round trip of `payload` against the server at `server`.
///
/// Resources are always torn down before this returns. A payload that does not come back
/// intact is reported as [`Error::IntegrityMismatch`] after the connection was closed.
pub fn run(config: &Config, server: SocketAddr, payload: &[u8]) -> Result<()> {
    if payload.is_empty() {
        return Err(Error::Config("the string to send must not be empty".to_owned()));
    }
    tracing::info!("send string: {}, len: {}", String::from_utf8_lossy(payload), payload.len());

    let mut source = payload.to_vec();
    let mut sink = vec![0u8; payload.len()];

    let channel = EventChannel::create_event_channel()
        .map_err(Error::resource("rdma_create_event_channel"))?;
    tracing::debug!("RDMA CM event channel is created");
    // SAFETY: the id is destroyed with the connection context, before `channel`.
    let id = unsafe { CmId::create_id(&channel) }.map_err(Error::resource("rdma_create_id"))?;

    let mut connector = ActiveConnector::new(
        &channel,
        config.connection.clone(),
        config.timeouts.clone(),
    );
    connector.resolve_addr(&id, &server)?;
    tracing::debug!("RDMA CM address resolved");
    connector.resolve_route(&id)?;
    tracing::info!("Trying to connect to server at : {} port: {}", server.ip(), server.port());

    let mut ctx = ConnectionContext::establish(id, &config.transport)?;
    tracing::debug!("{:?}", ctx);

    let result = session(&mut connector, &mut ctx, &mut source, &mut sink, config);

    let report = teardown_client(ctx, channel);
    if report.is_clean() {
        tracing::info!("Client resource clean up is complete");
    } else {
        tracing::warn!("Client resource clean up finished with errors: {}", report);
    }
    result
}

fn session<'buf>(
    connector: &mut ActiveConnector<'_, EventChannel>,
    ctx: &mut ConnectionContext<'buf>,
    source: &'buf mut [u8],
    sink: &'buf mut [u8],
    config: &Config,
) -> Result<()> {
    let access = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE;
    let payload = memory::register(Some(ctx.pd()), source, access)?;
    let readback = memory::register(Some(ctx.pd()), sink, access)?;
    let mut meta_send =
        memory::allocate_and_register(Some(ctx.pd()), DESCRIPTOR_LEN, AccessFlags::LOCAL_WRITE)?;
    let meta_recv =
        memory::allocate_and_register(Some(ctx.pd()), DESCRIPTOR_LEN, AccessFlags::LOCAL_WRITE)?;

    let result = converse(
        connector,
        ctx,
        &payload,
        &readback,
        &mut meta_send,
        &meta_recv,
        config,
    );

    ctx.hold(payload);
    ctx.hold(readback);
    ctx.hold_allocated(meta_send);
    ctx.hold_allocated(meta_recv);
    result
}

fn converse(
    connector: &mut ActiveConnector<'_, EventChannel>,
    ctx: &ConnectionContext<'_>,
    payload: &MemoryRegion<'_>,
    readback: &MemoryRegion<'_>,
    meta_send: &mut AllocatedRegion,
    meta_recv: &AllocatedRegion,
    config: &Config,
) -> Result<()> {
    // SAFETY (this and the posts below): `session` hands every region to `ctx`, whose teardown
    // destroys the queue pair before deregistering them. `payload` and `readback` borrow buffers
    // owned by `run` that outlive the context.
    unsafe { pre_post_descriptor_recv(ctx.id(), meta_recv) }?;
    connector.connect(ctx.id())?;
    tracing::info!("The client is connected successfully");

    let completions = ctx.completions();
    let remote = unsafe {
        exchange_with_server(
            ctx.id(),
            &completions,
            payload,
            meta_send,
            meta_recv,
            config.timeouts.completion(),
        )
    }?;
    unsafe {
        write_then_read(
            ctx.id(),
            &completions,
            payload,
            readback,
            &remote,
            config.timeouts.completion(),
        )
    }?;

    let verified = verify(payload.bytes(), readback.bytes());
    match &verified {
        Ok(()) => tracing::info!("src and dst buffers match"),
        Err(e) => tracing::error!("src and dst buffers don't match: {}", e),
    }

    let disconnected = connector.disconnect(ctx.id());
    match &disconnected {
        Ok(()) => tracing::info!("The client is disconnected"),
        Err(e) => tracing::error!("Failed to disconnect: {}", e),
    }
    verified.and(disconnected)
}
