//! Mock pigpio daemon for testing packetlights off the Pi
//!
//! Usage: cargo run -p packetlights-mock-pigpiod -- --reserved 14
//! Then start the server with `--pigpio 127.0.0.1:8888`

use clap::Parser;
use log::{error, info, warn};
use packetlights_pigpio_lib::{serve_connection, SimulatedGpio, DEFAULT_PORT};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};

#[derive(Parser, Debug)]
#[command(version, about = "Simulated pigpiod speaking the socket protocol")]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Lines that refuse output mode, like the UART pins on a real Pi
    #[arg(long, value_delimiter = ',')]
    reserved: Vec<u8>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    let args = Args::parse();

    let listener = match TcpListener::bind((args.host.as_str(), args.port)) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}:{}: {e}", args.host, args.port);
            std::process::exit(1);
        }
    };
    if !args.reserved.is_empty() {
        info!("Reserved lines: {:?}", args.reserved);
    }
    let gpio = Arc::new(Mutex::new(SimulatedGpio::with_reserved(&args.reserved)));
    info!("Mock pigpiod ready on {}:{}", args.host, args.port);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let peer = stream.peer_addr();
                info!("Client connected: {peer:?}");
                let gpio = gpio.clone();
                std::thread::spawn(move || {
                    match serve_connection(stream, &gpio) {
                        Ok(()) => info!("Client disconnected: {peer:?}"),
                        Err(e) => warn!("Client {peer:?} dropped: {e}"),
                    }
                });
            }
            Err(e) => warn!("Connection error: {e}"),
        }
    }
}
