//! The passive side: accept one client, hand it a buffer of the size it asked for, and wait for
//! it to leave. The one-sided operations themselves never involve the server.
use std::net::SocketAddr;

use rdma::ibv::AccessFlags;
use rdma::rdmacm::{CmId, EventChannel};

use crate::cm::PassiveListener;
use crate::config::Config;
use crate::descriptor::DESCRIPTOR_LEN;
use crate::error::{Error, Result};
use crate::exchange::{advertise_buffer, pre_post_descriptor_recv, receive_client_descriptor};
use crate::memory::{self, AllocatedRegion};
use crate::poller::{wait_for, Await};
use crate::resources::{teardown_server, ConnectionContext};

/// Serve a single client connection on `bind`.
pub fn run(config: &Config, bind: SocketAddr) -> Result<()> {
    let channel = EventChannel::create_event_channel()
        .map_err(Error::resource("rdma_create_event_channel"))?;
    tracing::debug!("RDMA CM event channel is created");
    // SAFETY: the listening id is destroyed in `teardown_server`, before `channel`.
    let listen_id =
        unsafe { CmId::create_id(&channel) }.map_err(Error::resource("rdma_create_id"))?;

    let mut listener = PassiveListener::new(
        &channel,
        &listen_id,
        config.connection.clone(),
        config.timeouts.clone(),
    );
    listener.listen(&bind)?;
    let local = listen_id.get_local_addr().unwrap_or(bind);
    tracing::info!(
        "Server is listening successfully at: {} , port: {}",
        local.ip(),
        local.port()
    );

    let (result, ctx) = match listener
        .await_request()
        .and_then(|id| ConnectionContext::establish(id, &config.transport))
    {
        Ok(mut ctx) => {
            tracing::debug!("{:?}", ctx);
            let result = session(&mut listener, &mut ctx, config);
            (result, Some(ctx))
        }
        Err(e) => (Err(e), None),
    };

    let report = teardown_server(ctx, listen_id, channel);
    if report.is_clean() {
        tracing::info!("Server shut-down is complete");
    } else {
        tracing::warn!("Server shut-down finished with errors: {}", report);
    }
    result
}

fn session(
    listener: &mut PassiveListener<'_, EventChannel, CmId>,
    ctx: &mut ConnectionContext<'_>,
    config: &Config,
) -> Result<()> {
    let meta_recv =
        memory::allocate_and_register(Some(ctx.pd()), DESCRIPTOR_LEN, AccessFlags::LOCAL_WRITE)?;
    let mut meta_send =
        memory::allocate_and_register(Some(ctx.pd()), DESCRIPTOR_LEN, AccessFlags::LOCAL_WRITE)?;
    let mut reply = None;

    let result = converse(listener, ctx, &meta_recv, &mut meta_send, &mut reply, config);

    ctx.hold_allocated(meta_recv);
    ctx.hold_allocated(meta_send);
    if let Some(reply) = reply {
        ctx.hold_allocated(reply);
    }
    result
}

fn converse(
    listener: &mut PassiveListener<'_, EventChannel, CmId>,
    ctx: &ConnectionContext<'_>,
    meta_recv: &AllocatedRegion,
    meta_send: &mut AllocatedRegion,
    reply: &mut Option<AllocatedRegion>,
    config: &Config,
) -> Result<()> {
    // SAFETY (this and the advertisement below): `session` hands every region to `ctx`, whose
    // teardown destroys the queue pair before deregistering them.
    unsafe { pre_post_descriptor_recv(ctx.id(), meta_recv) }?;
    listener.accept(ctx.id())?;
    match ctx.id().get_peer_addr() {
        Ok(peer) => tracing::info!("A new connection is accepted from {}", peer.ip()),
        Err(e) => tracing::warn!("Failed to get the peer address: {}", e),
    }

    let completions = ctx.completions();
    let client = receive_client_descriptor(&completions, meta_recv, config.timeouts.completion())?;

    let length = client.length as usize;
    let region = reply.insert(memory::allocate_and_register(
        Some(ctx.pd()),
        length,
        AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE,
    )?);
    unsafe { advertise_buffer(ctx.id(), &*region, meta_send) }?;
    wait_for(&completions, Await::OwnSend, config.timeouts.completion())?;

    listener.await_disconnect()?;
    tracing::info!("A disconnect event is received from the client...");
    Ok(())
}
