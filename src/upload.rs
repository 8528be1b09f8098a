//! C2S (upload) subtest engine.
//!
//! Writes a fixed pseudorandom payload to one or more measurement flows as
//! fast as the server accepts it, with the same 250 ms sampler as the
//! download engine, then half-closes the flows and completes the
//! control-channel exchange.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use rand::RngCore;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval};

use crate::client::Session;
use crate::error::Result;
use crate::msg::MsgType;
use crate::net::{Conn, Stream};
use crate::params;
use crate::settings::{NettestFlags, ProtocolFlags};
use crate::ws;

pub(crate) async fn run(sess: &mut Session, tid: NettestFlags) -> Result<()> {
    let (port, nflows) = sess.channel.msg_expect_test_prepare().await?;
    sess.emit_debug(&format!("c2s: port={port} nflows={nflows}"));

    let mut flows = Vec::with_capacity(nflows as usize);
    for _ in 0..nflows {
        flows.push(sess.dial_measurement(&port, params::WS_PROTO_C2S).await?);
    }
    sess.channel.msg_expect_empty(MsgType::TestStart).await?;
    sess.emit_info("upload test in progress");

    // The payload content is irrelevant to the server; every flow shares
    // one pseudorandom chunk.
    let mut rng = SmallRng::from_os_rng();
    let mut chunk = vec![0u8; params::UPLOAD_CHUNK_SIZE];
    rng.fill_bytes(&mut chunk);
    let payload = Bytes::from(chunk);

    let websocket = sess.settings.protocol_flags.contains(ProtocolFlags::WEBSOCKET);
    let total = Arc::new(AtomicU64::new(0));
    let (stop_tx, stop_rx) = watch::channel(false);
    let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
    let mut tasks = Vec::with_capacity(flows.len());
    for conn in flows {
        tasks.push(tokio::spawn(feed_flow(
            conn,
            websocket,
            payload.clone(),
            Arc::clone(&total),
            stop_rx.clone(),
            done_tx.clone(),
        )));
    }
    drop(done_tx);

    let max_runtime = sess.settings.max_runtime.as_secs_f64();
    let start = Instant::now();
    let mut prev = start;
    let mut prev_bytes = 0u64;
    let mut ticker = interval(params::SAMPLE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick completes immediately
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                let bytes = total.load(Ordering::Relaxed);
                sess.emit_performance(
                    tid,
                    nflows,
                    (bytes - prev_bytes) as f64,
                    (now - prev).as_secs_f64(),
                    (now - start).as_secs_f64(),
                    max_runtime,
                );
                prev = now;
                prev_bytes = bytes;
                if (now - start).as_secs_f64() >= max_runtime {
                    break;
                }
            }
            _ = done_rx.recv() => break, // every flow gave up early
        }
    }
    let _ = stop_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }

    let elapsed = start.elapsed().as_secs_f64();
    let bytes = total.load(Ordering::Relaxed) as f64;
    sess.emit_debug(&format!("c2s: sent {bytes} bytes in {elapsed:.2} s"));

    let server_speed = sess.channel.msg_expect(MsgType::TestMsg).await?;
    sess.emit_result("summary", "c2s_throughput", server_speed.trim());
    sess.channel.msg_expect_empty(MsgType::TestFinalize).await?;
    Ok(())
}

async fn feed_flow(
    mut conn: Conn<Stream>,
    websocket: bool,
    payload: Bytes,
    total: Arc<AtomicU64>,
    mut stop: watch::Receiver<bool>,
    _done: mpsc::Sender<()>,
) {
    loop {
        if *stop.borrow() {
            break;
        }
        let sent = tokio::select! {
            sent = write_chunk(&mut conn, websocket, &payload) => sent,
            _ = stop.changed() => break,
        };
        match sent {
            Ok(count) => {
                total.fetch_add(count as u64, Ordering::Relaxed);
            }
            Err(_) => break,
        }
    }
    // Tell the server we are done, then drain whatever it still has in
    // flight so its write side can close cleanly.
    if websocket {
        let _ = ws::send_close(&mut conn, &1000u16.to_be_bytes()).await;
    } else {
        let _ = conn.shutdown().await;
    }
    conn.set_deadline(params::CLOSE_GRACE);
    let mut scrap = [0u8; 2048];
    while matches!(conn.recv(&mut scrap).await, Ok(count) if count > 0) {}
}

async fn write_chunk(conn: &mut Conn<Stream>, websocket: bool, payload: &Bytes) -> Result<usize> {
    if websocket {
        ws::send_frame(conn, ws::FIN_FLAG | ws::OP_BINARY, payload).await?;
    } else {
        conn.sendn(payload).await?;
    }
    Ok(payload.len())
}
