use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    protocol::{LockMode, Reply, Request, read_frame, write_frame},
};

/// Request/reply connection to a lock broker. One request is outstanding at a
/// time.
pub struct LockClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl LockClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        info!("connected to {addr}");

        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    pub async fn request(&mut self, request: &Request) -> Result<Reply> {
        self.send_raw(&request.to_string()).await
    }

    /// Sends one already-formatted line and waits for its reply.
    pub async fn send_raw(&mut self, line: &str) -> Result<Reply> {
        write_frame(&mut self.writer, line)
            .await
            .context("failed to send request")?;
        let reply = read_frame(&mut self.reader)
            .await
            .context("failed to read reply")?
            .context("server closed the connection")?;
        Ok(Reply::parse(&reply))
    }

    pub async fn lock(&mut self, resource: &str, mode: LockMode) -> Result<Reply> {
        self.request(&Request::Lock {
            resource: resource.to_string(),
            mode,
        })
        .await
    }

    pub async fn unlock(&mut self, resource: &str, mode: LockMode) -> Result<Reply> {
        self.request(&Request::Unlock {
            resource: resource.to_string(),
            mode,
        })
        .await
    }

    pub async fn read(&mut self, resource: &str) -> Result<Reply> {
        self.request(&Request::Read {
            resource: resource.to_string(),
        })
        .await
    }

    pub async fn write(&mut self, resource: &str, payload: &str) -> Result<Reply> {
        self.request(&Request::Write {
            resource: resource.to_string(),
            payload: payload.to_string(),
        })
        .await
    }

    pub async fn shutdown(mut self) {
        if let Err(error) = self.writer.shutdown().await {
            warn!(?error, "failed to shutdown client writer cleanly");
        }
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    if args.content.contains(['\n', '\r']) {
        bail!("content must fit on a single line");
    }

    let mut client = LockClient::connect(args.server).await?;
    let resource = args.resource.as_str();
    let hold = Duration::from_secs(args.hold_secs);

    write_stdout(&format!("*** requesting {} lock on {resource}", args.mode)).await?;
    expect_ok(client.lock(resource, args.mode).await?, "LOCK")?;
    write_stdout(&format!("*** acquired {} lock on {resource}", args.mode)).await?;

    match args.mode {
        LockMode::Write => {
            if !hold.is_zero() {
                write_stdout(&format!("*** holding for {}s", args.hold_secs)).await?;
                tokio::time::sleep(hold).await;
            }
            expect_ok(client.write(resource, &args.content).await?, "WRITE")?;
            write_stdout(&format!("*** wrote {resource}: {}", args.content)).await?;
        }
        LockMode::Read => {
            let value = match client.read(resource).await? {
                Reply::Value(value) => value,
                other => bail!("READ failed: {other}"),
            };
            write_stdout(&format!("*** read {resource}: {value}")).await?;
            if !hold.is_zero() {
                write_stdout(&format!("*** holding for {}s", args.hold_secs)).await?;
                tokio::time::sleep(hold).await;
            }
        }
    }

    client.unlock(resource, args.mode).await?;
    write_stdout(&format!("*** released {resource}")).await?;
    client.shutdown().await;

    Ok(())
}

fn expect_ok(reply: Reply, command: &str) -> Result<()> {
    match reply {
        Reply::Ok => Ok(()),
        other => bail!("{command} failed: {other}"),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
