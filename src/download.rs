//! S2C (download) subtest engine.
//!
//! Drains one or more measurement flows into a throwaway buffer while a
//! 250 ms sampler reports throughput, until the runtime cap or the server
//! running out of data, then completes the control-channel exchange.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval};

use crate::client::Session;
use crate::error::{Error, Result};
use crate::msg::MsgType;
use crate::net::{Conn, Stream};
use crate::params;
use crate::settings::{NettestFlags, ProtocolFlags};
use crate::ws;

pub(crate) async fn run(sess: &mut Session, tid: NettestFlags) -> Result<()> {
    let (port, nflows) = sess.channel.msg_expect_test_prepare().await?;
    sess.emit_debug(&format!("s2c: port={port} nflows={nflows}"));

    let mut flows = Vec::with_capacity(nflows as usize);
    for _ in 0..nflows {
        flows.push(sess.dial_measurement(&port, params::WS_PROTO_S2C).await?);
    }
    sess.channel.msg_expect_empty(MsgType::TestStart).await?;
    sess.emit_info("download test in progress");

    let websocket = sess.settings.protocol_flags.contains(ProtocolFlags::WEBSOCKET);
    let total = Arc::new(AtomicU64::new(0));
    let (stop_tx, stop_rx) = watch::channel(false);
    let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
    let mut tasks = Vec::with_capacity(flows.len());
    for conn in flows {
        tasks.push(tokio::spawn(drain_flow(
            conn,
            websocket,
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
            _ = done_rx.recv() => break, // every flow has finished
        }
    }
    let _ = stop_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }

    let elapsed = start.elapsed().as_secs_f64();
    let bytes = total.load(Ordering::Relaxed) as f64;
    sess.emit_debug(&format!("s2c: received {bytes} bytes in {elapsed:.2} s"));

    // The server reports the throughput it measured; we answer with ours,
    // in kbit/s, then consume its variable dump through TEST_FINALIZE.
    let server_speed = sess.channel.msg_expect(MsgType::TestMsg).await?;
    sess.emit_result("summary", "s2c_throughput", server_speed.trim());

    let client_speed = if elapsed > 0.0 { bytes * 8.0 / 1000.0 / elapsed } else { 0.0 };
    sess.channel
        .msg_write(MsgType::TestMsg, &format!("{client_speed:.2}"))
        .await?;

    loop {
        let (kind, body) = sess.channel.msg_read().await?;
        match kind {
            MsgType::TestFinalize => break,
            MsgType::TestMsg => sess.emit_keyed_results(&body),
            _ => return Err(Error::WsProto),
        }
    }
    Ok(())
}

async fn drain_flow(
    mut conn: Conn<Stream>,
    websocket: bool,
    total: Arc<AtomicU64>,
    mut stop: watch::Receiver<bool>,
    _done: mpsc::Sender<()>,
) {
    let mut buf = vec![0u8; params::DOWNLOAD_BUF_SIZE];
    loop {
        if *stop.borrow() {
            break;
        }
        let received = tokio::select! {
            received = read_some(&mut conn, websocket, &mut buf) => received,
            _ = stop.changed() => break,
        };
        match received {
            Ok(0) => break, // the server is done sending
            Ok(count) => {
                total.fetch_add(count as u64, Ordering::Relaxed);
            }
            Err(_) => break,
        }
    }
    let _ = conn.shutdown().await;
}

async fn read_some(conn: &mut Conn<Stream>, websocket: bool, buf: &mut [u8]) -> Result<usize> {
    if websocket {
        match ws::recv_frame(conn).await {
            Ok((_opcode, _fin, payload)) => Ok(payload.len()),
            Err(Error::Eof) => Ok(0),
            Err(err) => Err(err),
        }
    } else {
        conn.recv(buf).await
    }
}
