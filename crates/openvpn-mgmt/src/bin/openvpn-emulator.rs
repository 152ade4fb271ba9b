//! Scripted stand-in for the `openvpn` binary.
//!
//! Listens on the `--management` address it is launched with, accepts one
//! connection, replays a fixed connect sequence as real-time lines and
//! answers a small command vocabulary the way OpenVPN does. `signal SIGTERM`
//! ends the session and the process.

use clap::Parser;
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

const GREETING: &[&str] = &[
    ">INFO:OpenVPN Management Interface Version 1 -- type 'help' for more info",
    ">PASSWORD:Need 'Auth' username/password",
    ">STATE:1522855903,CONNECTING,,,,,,",
    ">STATE:1522855903,WAIT,,,,,,",
    ">STATE:1522855903,AUTH,,,,,,",
    ">STATE:1522855904,GET_CONFIG,,,,,,",
    ">STATE:1522855904,ASSIGN_IP,,10.8.0.133,,,,",
    ">STATE:1522855905,CONNECTED,SUCCESS,10.8.0.133,1.2.3.4,1194,,",
    ">BYTECOUNT:36987,32252",
];

const EXITING: &str = ">STATE:1522855911,EXITING,SIGTERM,,,,,";

const VERSION_BANNER: &str =
    "OpenVPN 2.6.8 x86_64-pc-linux-gnu [SSL (OpenSSL)] [LZO] [LZ4] [EPOLL] [MH/PKTINFO] [AEAD]";

#[derive(Parser, Debug)]
#[command(name = "openvpn-emulator")]
#[command(about = "Speaks the OpenVPN management protocol from a fixed script")]
struct Cli {
    /// `<host> <port>` or `<path> unix`
    #[arg(long, num_args = 2, value_names = ["ADDR", "PORT"], required_unless_present = "version")]
    management: Vec<String>,

    /// Print an OpenVPN version banner and exit.
    #[arg(long)]
    version: bool,

    /// Accepted for compatibility; prompts are always emitted.
    #[arg(long)]
    management_query_passwords: bool,

    /// Exit status once the session ends.
    #[arg(long, default_value_t = 0)]
    exit_code: u8,

    /// Delay before the management listener comes up.
    #[arg(long, default_value_t = 0)]
    listen_delay_ms: u64,
}

enum Reply {
    Lines(Vec<String>),
    Exit,
}

fn reply(command: &str) -> Reply {
    let lines: Vec<String> = match command {
        "SINGLELINE_CMD" => vec!["SUCCESS: SINGLELINE_CMD_OK".into()],
        "MULTILINE_CMD" => vec![
            "SUCCESS: MULTILINE_CMD_OK".into(),
            "LINE1".into(),
            "LINE2".into(),
            "END".into(),
        ],
        "signal SIGTERM" => return Reply::Exit,
        "state on" => vec!["SUCCESS: real-time state notification set to ON".into()],
        "hold release" => vec!["SUCCESS: hold release succeeded".into()],
        "pid" => vec![format!("SUCCESS: pid={}", std::process::id())],
        cmd if cmd.starts_with("bytecount ") => {
            vec!["SUCCESS: bytecount interval changed".into()]
        }
        cmd if cmd.starts_with("username ") => {
            vec!["SUCCESS: 'Auth' username entered, but not yet verified".into()]
        }
        cmd if cmd.starts_with("password ") => {
            vec!["SUCCESS: 'Auth' password entered, but not yet verified".into()]
        }
        cmd if cmd.starts_with("client-auth-nt ") => {
            vec!["SUCCESS: client-auth command succeeded".into()]
        }
        cmd => vec![format!("ERROR: Unknown command {}", cmd)],
    };
    Reply::Lines(lines)
}

async fn write_line<W: AsyncWrite + Unpin>(w: &mut W, line: &str) -> std::io::Result<()> {
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await?;
    w.flush().await
}

async fn serve<S>(stream: S) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let (read, mut write) = tokio::io::split(stream);
    for line in GREETING {
        write_line(&mut write, line).await?;
    }

    let mut lines = BufReader::new(read).lines();
    while let Some(command) = lines.next_line().await? {
        log::info!("command: {}", command.split_whitespace().next().unwrap_or(""));
        match reply(command.trim()) {
            Reply::Lines(out) => {
                for line in out {
                    write_line(&mut write, &line).await?;
                }
            }
            Reply::Exit => {
                write_line(&mut write, "SUCCESS: signal SIGTERM thrown").await?;
                write_line(&mut write, EXITING).await?;
                write.shutdown().await?;
                return Ok(());
            }
        }
    }
    Ok(())
}

async fn run(cli: &Cli) -> std::io::Result<()> {
    if cli.listen_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(cli.listen_delay_ms)).await;
    }

    let (addr, port) = (&cli.management[0], &cli.management[1]);
    if port == "unix" {
        #[cfg(unix)]
        {
            let _ = std::fs::remove_file(addr);
            let listener = tokio::net::UnixListener::bind(addr)?;
            log::info!("listening on {}", addr);
            let (stream, _) = listener.accept().await?;
            return serve(stream).await;
        }
        #[cfg(not(unix))]
        return Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        ));
    }

    let port: u16 = port
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("port: {}", e)))?;
    let listener = tokio::net::TcpListener::bind((addr.as_str(), port)).await?;
    log::info!("listening on {}:{}", addr, port);
    let (stream, peer) = listener.accept().await?;
    log::info!("management client connected from {}", peer);
    serve(stream).await
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if cli.version {
        println!("{}", VERSION_BANNER);
        return ExitCode::SUCCESS;
    }

    match run(&cli).await {
        Ok(()) => ExitCode::from(cli.exit_code),
        Err(e) => {
            log::error!("emulator failed: {}", e);
            ExitCode::from(2)
        }
    }
}
