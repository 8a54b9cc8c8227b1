/*
 * Copyright (C) 2025-2026 the tidepool authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use clap::{Arg, ArgAction, Command};
use log::{info, LevelFilter};
use std::cell::RefCell;
use std::error::Error;
use std::process;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tidepool::connection::{WebSocket, WebSocketHandler};
use tidepool::logger;
use tidepool::server::Server;

const PROGRAM_NAME: &str = "tidepool-server";
const DEFAULT_PORT: &str = "9090";

struct Args {
    port: u16,
    static_dir: String,
    verbose: bool,
}

/// Echoes every text and binary message back to the sender. Handy for
/// poking at the server with a browser console.
struct EchoHandler;

impl WebSocketHandler for EchoHandler {
    fn on_connect(&mut self, ws: &mut dyn WebSocket) {
        info!("websocket connected: {}", ws.peer_addr());
    }

    fn on_text(&mut self, ws: &mut dyn WebSocket, text: &str) {
        ws.send_text(text);
    }

    fn on_binary(&mut self, ws: &mut dyn WebSocket, data: &[u8]) {
        ws.send_binary(data);
    }

    fn on_disconnect(&mut self, ws: &mut dyn WebSocket) {
        info!("websocket disconnected: {}", ws.peer_addr());
    }
}

fn process_args_and_run(args: Args) -> Result<(), Box<dyn Error>> {
    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    logger::init(level)?;

    let bind_addr = format!("127.0.0.1:{}", args.port).parse()?;

    let mut server = Server::new(&args.static_dir, bind_addr)?;

    server.add_web_socket_handler("/ws/echo", Rc::new(RefCell::new(EchoHandler)), false);

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop))?;

    info!(
        "serving {} on http://{} (websocket echo at /ws/echo)",
        args.static_dir,
        server.local_addr()
    );

    server.run(&stop)?;

    info!("stopped");

    Ok(())
}

fn main() {
    let matches = Command::new(PROGRAM_NAME)
        .version(env!("CARGO_PKG_VERSION"))
        .about("Embedded HTTP/websocket server")
        .arg(
            Arg::new("port")
                .long("port")
                .short('p')
                .num_args(1)
                .value_name("port")
                .default_value(DEFAULT_PORT)
                .help("Port to listen on"),
        )
        .arg(
            Arg::new("static-dir")
                .long("static-dir")
                .short('s')
                .num_args(1)
                .value_name("dir")
                .default_value(".")
                .help("Directory to serve files from"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .action(ArgAction::SetTrue)
                .help("Log debug output"),
        )
        .get_matches();

    let port = match matches.get_one::<String>("port").unwrap().parse() {
        Ok(port) => port,
        Err(_) => {
            eprintln!("error: port must be an integer between 0 and 65535");
            process::exit(1);
        }
    };

    let args = Args {
        port,
        static_dir: matches.get_one::<String>("static-dir").unwrap().clone(),
        verbose: matches.get_flag("verbose"),
    };

    if let Err(e) = process_args_and_run(args) {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}
