//! Transport handshake
//!
//! Both sides send a [`Hello`] carrying their public key and a fresh nonce,
//! then prove key ownership by signing the other side's nonce together with
//! their own peer id. The handshake yields the remote [`PeerId`]; PoR
//! authentication runs afterwards on the registered connection.

use crate::address::Address;
use crate::error::{NetworkError, Result};
use crate::identity::{Keypair, PeerId, verify_signature};
use crate::wire::{Frame, Hello};
use crate::PROTOCOL_VERSION;
use kadlink_crypto::hash::{HANDSHAKE_CONTEXT, derive};
use kadlink_transport::{FrameReader, FrameWriter};
use rand::RngCore;
use std::borrow::Cow;
use tokio::io::{AsyncRead, AsyncWrite};

/// Most listen addresses kept from a remote hello
const MAX_ADVERTISED_ADDRS: usize = 16;

/// Result of a successful handshake
#[derive(Debug)]
pub(crate) struct HandshakeOutcome {
    pub(crate) peer_id: PeerId,
    pub(crate) listen_addrs: Vec<Address>,
}

/// Run the handshake on a fresh connection
pub(crate) async fn perform<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    keypair: &Keypair,
    listen_addrs: Vec<Address>,
) -> Result<HandshakeOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    let public_key = keypair.public_key();

    send(
        writer,
        &Frame::Hello(Hello {
            protocol_version: PROTOCOL_VERSION,
            public_key,
            nonce,
            listen_addrs,
        }),
    )
    .await?;

    let remote = match receive(reader).await? {
        Frame::Hello(hello) => hello,
        other => {
            return Err(NetworkError::Handshake(Cow::Owned(format!(
                "expected hello, got {}",
                other.kind()
            ))));
        }
    };
    if remote.protocol_version != PROTOCOL_VERSION {
        return Err(NetworkError::Handshake(Cow::Owned(format!(
            "protocol version mismatch: local {}, remote {}",
            PROTOCOL_VERSION, remote.protocol_version
        ))));
    }
    let peer_id = PeerId::from_public_key(&remote.public_key);
    if peer_id == keypair.peer_id() {
        return Err(NetworkError::handshake("connected to self"));
    }

    let transcript = derive(
        HANDSHAKE_CONTEXT,
        &[&remote.nonce, keypair.peer_id().as_bytes()],
    );
    send(
        writer,
        &Frame::HelloProof {
            signature: keypair.sign(&transcript).to_vec(),
        },
    )
    .await?;

    let signature = match receive(reader).await? {
        Frame::HelloProof { signature } => signature,
        other => {
            return Err(NetworkError::Handshake(Cow::Owned(format!(
                "expected hello proof, got {}",
                other.kind()
            ))));
        }
    };
    let expected = derive(HANDSHAKE_CONTEXT, &[&nonce, peer_id.as_bytes()]);
    verify_signature(&remote.public_key, &expected, &signature)
        .map_err(|_| NetworkError::handshake("remote failed to prove key ownership"))?;

    let listen_addrs = remote
        .listen_addrs
        .into_iter()
        .filter(|a| a.peer_id().is_none_or(|p| p == peer_id))
        .take(MAX_ADVERTISED_ADDRS)
        .map(|a| a.with_peer_id(peer_id))
        .collect();

    Ok(HandshakeOutcome {
        peer_id,
        listen_addrs,
    })
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut FrameWriter<W>, frame: &Frame) -> Result<()> {
    writer.write_frame(&frame.encode()?).await?;
    writer.flush().await?;
    Ok(())
}

async fn receive<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Result<Frame> {
    let bytes = reader
        .read_frame()
        .await?
        .ok_or(NetworkError::handshake("connection closed during handshake"))?;
    Frame::decode(&bytes)
}
