//! Device Simulator
//!
//! Pretends to be an RS-WFIREX4 on the local network so the client can be
//! exercised without hardware. Send frames are acknowledged, a learn
//! request is answered with a canned code after a short pause, and a
//! sensor request gets a reading that drifts a little on every call.
//!
//! Usage: cargo run --bin device-sim [bind_addr]

use rand::Rng;
use std::env;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Duration};

const HEADER: u8 = 0xAA;
const OPCODE_SEND: u8 = 0x11;
const OPCODE_LEARN: u8 = 0x12;
const OPCODE_TELEMETRY: u8 = 0x18;

/// What a "button press" captures
const LEARNED_CODE: [u8; 12] = [
    0x02, 0x20, 0xE0, 0x04, 0x00, 0x48, 0xB6, 0x00, 0x00, 0x06, 0x16, 0x05,
];

/// Time the simulated user takes to press the button
const LEARN_DELAY: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let bind_addr: SocketAddr = env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:60001".to_string())
        .parse()?;

    let listener = TcpListener::bind(bind_addr).await?;

    println!("📟 WFIREX4 Device Simulator");
    println!("  Listening: {}", listener.local_addr()?);
    println!("  Learn reply: {}", hex::encode(LEARNED_CODE));
    println!();

    loop {
        let (socket, peer) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(e) = handle(socket).await {
                println!("   ❌ {}: {}", peer, e);
            }
        });
    }
}

async fn handle(mut socket: TcpStream) -> anyhow::Result<()> {
    let peer = socket.peer_addr()?;
    let mut buf = [0u8; 1024];
    let len = socket.read(&mut buf).await?;
    let request = &buf[..len];

    if len < 4 || request[0] != HEADER {
        println!("⚠️  {} sent {} unexpected byte(s): {}", peer, len, hex::encode(request));
        socket.shutdown().await?;
        return Ok(());
    }

    match request[3] {
        OPCODE_SEND => {
            let code = request.get(7..len - 1).unwrap_or_default();
            println!("📡 {} send: {}", peer, hex::encode(code));
            socket.write_all(&[HEADER, 0x00, 0x01, OPCODE_SEND, 0x00]).await?;
        }
        OPCODE_LEARN => {
            println!("🎓 {} learn: waiting {:?} for a button press", peer, LEARN_DELAY);
            sleep(LEARN_DELAY).await;
            socket.write_all(&learn_response(&LEARNED_CODE)).await?;
            println!("   ✅ Sent learned code");
        }
        OPCODE_TELEMETRY => {
            let response = telemetry_response();
            println!("🌡️  {} sensor: {}", peer, hex::encode(&response));
            socket.write_all(&response).await?;
        }
        other => {
            println!("⚠️  {} unknown opcode 0x{:02X}", peer, other);
        }
    }

    socket.shutdown().await?;
    Ok(())
}

fn learn_response(code: &[u8]) -> Vec<u8> {
    let body_len = (code.len() + 5) as u16;
    let mut packet = vec![HEADER];
    packet.extend_from_slice(&body_len.to_be_bytes());
    packet.push(OPCODE_LEARN);
    packet.extend_from_slice(&[0x00, 0x00]);
    packet.extend_from_slice(&(code.len() as u16).to_be_bytes());
    packet.extend_from_slice(code);
    packet
}

/// Sensor frame: humidity, temperature (both ×10), lux, activity
fn telemetry_response() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let humidity: u16 = rng.gen_range(400..=600);
    let temperature: u16 = rng.gen_range(200..=260);
    let light: u16 = rng.gen_range(100..=500);
    let activity: u8 = rng.gen_range(200..=255);

    let mut packet = vec![HEADER, 0x00, 0x0C, OPCODE_TELEMETRY, 0x00];
    packet.extend_from_slice(&humidity.to_be_bytes());
    packet.extend_from_slice(&temperature.to_be_bytes());
    packet.extend_from_slice(&light.to_be_bytes());
    packet.push(activity);
    packet
}
