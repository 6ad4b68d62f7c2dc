//! # File-Transfer Session
//!
//! A small passive-mode FTP client on tokio, just enough for the collector:
//! `USER`/`PASS`, `TYPE I`, `PASV`, `STOR`, `RETR`, `QUIT`. Every network
//! operation runs under the configured timeout.
//!
//! [`SessionTransport`] keeps one session open across cycles. When a send
//! fails on a dead connection it reconnects and retries the batch exactly
//! once, then gives up until the next cycle.

use super::{
    Batch, TransferError, Transport, REMOTE_COMMAND, REMOTE_DETAIL, REMOTE_STATION_INFO,
    REMOTE_STATUS, REMOTE_TOTAL,
};
use crate::config::{self, TransportConfig};
use crate::params::RemoteCommand;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// An FTP reply: code and the text of its last line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

/// One logged-in control connection.
pub struct FtpClient {
    control: BufReader<TcpStream>,
    peer: IpAddr,
    timeout: Duration,
}

impl FtpClient {
    /// Connect and log in.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, TransferError> {
        let stream = within(timeout, "connect", TcpStream::connect((host, port)))
            .await?
            .map_err(|e| TransferError::Connect(format!("{}:{}: {}", host, port, e)))?;
        let peer = stream.peer_addr()?.ip();
        let mut client = FtpClient {
            control: BufReader::new(stream),
            peer,
            timeout,
        };

        let greeting = client.read_reply().await?;
        if greeting.code != 220 {
            return Err(TransferError::Connect(format!("greeting {}", greeting.text)));
        }
        let user_reply = client.command(&format!("USER {}", user)).await?;
        if user_reply.code == 331 {
            let pass = client.command(&format!("PASS {}", password)).await?;
            if pass.code != 230 && pass.code != 202 {
                return Err(TransferError::Connect(format!("login rejected: {}", pass.text)));
            }
        } else if user_reply.code != 230 {
            return Err(TransferError::Connect(format!("login rejected: {}", user_reply.text)));
        }
        client.expect("TYPE I", &[200]).await?;
        debug!("Logged in to {}:{}", host, port);
        Ok(client)
    }

    /// Upload `bytes` as `name`.
    pub async fn store(&mut self, name: &str, bytes: &[u8]) -> Result<(), TransferError> {
        let mut data = self.passive().await?;
        self.expect(&format!("STOR {}", name), &[125, 150]).await?;
        within(self.timeout, "upload", data.write_all(bytes)).await??;
        within(self.timeout, "upload", data.shutdown()).await??;
        drop(data);
        let done = self.read_reply().await?;
        if done.code != 226 && done.code != 250 {
            return Err(TransferError::Protocol(format!("STOR {}: {}", name, done.text)));
        }
        debug!("Stored {} ({} bytes)", name, bytes.len());
        Ok(())
    }

    /// Download `name`. A missing file is [`TransferError::NotFound`].
    pub async fn retrieve(&mut self, name: &str) -> Result<Vec<u8>, TransferError> {
        let mut data = self.passive().await?;
        let reply = self.command(&format!("RETR {}", name)).await?;
        match reply.code {
            125 | 150 => {}
            550 => return Err(TransferError::NotFound(name.to_string())),
            _ => return Err(TransferError::Protocol(format!("RETR {}: {}", name, reply.text))),
        }
        let mut bytes = Vec::new();
        within(self.timeout, "download", data.read_to_end(&mut bytes)).await??;
        drop(data);
        let done = self.read_reply().await?;
        if done.code != 226 && done.code != 250 {
            return Err(TransferError::Protocol(format!("RETR {}: {}", name, done.text)));
        }
        Ok(bytes)
    }

    /// Say goodbye. Errors are irrelevant at this point.
    pub async fn quit(mut self) {
        let _ = self.command("QUIT").await;
    }

    // -- Private Implementation --

    async fn command(&mut self, line: &str) -> Result<Reply, TransferError> {
        let shown = if line.starts_with("PASS ") { "PASS ****" } else { line };
        debug!("FTP > {}", shown);
        let wire = format!("{}\r\n", line);
        let control = self.control.get_mut();
        within(self.timeout, "command", control.write_all(wire.as_bytes())).await??;
        self.read_reply().await
    }

    async fn expect(&mut self, line: &str, codes: &[u16]) -> Result<Reply, TransferError> {
        let reply = self.command(line).await?;
        if codes.contains(&reply.code) {
            Ok(reply)
        } else {
            Err(TransferError::Protocol(format!("{}: {} {}", line, reply.code, reply.text)))
        }
    }

    async fn read_reply(&mut self) -> Result<Reply, TransferError> {
        let mut first = String::new();
        self.read_line(&mut first).await?;
        let code = reply_code(&first)?;

        // Multi-line reply: "123-..." up to a line starting with "123 "
        let mut last = first;
        if last.as_bytes().get(3) == Some(&b'-') {
            let end = format!("{} ", code);
            loop {
                let mut line = String::new();
                self.read_line(&mut line).await?;
                if line.starts_with(&end) {
                    last = line;
                    break;
                }
            }
        }
        let reply = Reply {
            code,
            text: last.get(4..).unwrap_or("").trim_end().to_string(),
        };
        debug!("FTP < {} {}", reply.code, reply.text);
        if reply.code == 421 {
            // server is closing the control connection (idle timeout, shutdown)
            return Err(TransferError::Connect(format!("421 {}", reply.text)));
        }
        Ok(reply)
    }

    async fn read_line(&mut self, buf: &mut String) -> Result<(), TransferError> {
        let n = within(self.timeout, "reply", self.control.read_line(buf)).await??;
        if n == 0 {
            return Err(TransferError::Connect("connection closed".to_string()));
        }
        Ok(())
    }

    async fn passive(&mut self) -> Result<TcpStream, TransferError> {
        let reply = self.expect("PASV", &[227]).await?;
        let addr = parse_pasv(&reply.text)?;
        // Use the control peer: the advertised address is often a private one.
        let target = SocketAddr::new(self.peer, addr.port());
        let stream = within(self.timeout, "data connect", TcpStream::connect(target))
            .await?
            .map_err(|e| TransferError::Connect(format!("data {}: {}", target, e)))?;
        Ok(stream)
    }
}

async fn within<F: Future>(
    timeout: Duration,
    what: &'static str,
    fut: F,
) -> Result<F::Output, TransferError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| TransferError::Timeout(what))
}

fn reply_code(line: &str) -> Result<u16, TransferError> {
    line.get(..3)
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| TransferError::Protocol(format!("malformed reply {:?}", line.trim_end())))
}

/// Address from `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`.
fn parse_pasv(text: &str) -> Result<SocketAddr, TransferError> {
    let bad = || TransferError::Protocol(format!("malformed PASV reply {:?}", text));
    let start = text.find('(').ok_or_else(bad)? + 1;
    let end = start + text[start..].find(')').ok_or_else(bad)?;
    let parts: Vec<u8> = text[start..end]
        .split(',')
        .map(|p| p.trim().parse::<u8>())
        .collect::<Result<_, _>>()
        .map_err(|_| bad())?;
    let [a, b, c, d, p1, p2] = parts[..] else {
        return Err(bad());
    };
    let ip = Ipv4Addr::new(a, b, c, d);
    Ok(SocketAddr::new(IpAddr::V4(ip), u16::from(p1) << 8 | u16::from(p2)))
}

/// Persistent session to the collector.
pub struct SessionTransport {
    settings: TransportConfig,
    timeout: Duration,
    client: Option<FtpClient>,
}

impl SessionTransport {
    pub fn new(settings: TransportConfig) -> Self {
        let timeout = Duration::from_secs(settings.timeout_secs);
        SessionTransport {
            settings,
            timeout,
            client: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn session(&mut self) -> Result<&mut FtpClient, TransferError> {
        if self.client.is_none() {
            let s = &self.settings;
            let client =
                FtpClient::connect(&s.host, s.port, &s.user, &s.password, self.timeout).await?;
            info!("File-transfer session open to {}", s.host);
            self.client = Some(client);
        }
        self.client
            .as_mut()
            .ok_or_else(|| TransferError::Connect("no session".to_string()))
    }

    async fn send_batch(&mut self, batch: &Batch) -> Result<Option<RemoteCommand>, TransferError> {
        let info = batch
            .station_info
            .as_ref()
            .map(toml::to_string_pretty)
            .transpose()
            .map_err(|e| TransferError::Decode(e.to_string()))?;
        let status = batch
            .status
            .to_toml()
            .map_err(|e| TransferError::Decode(e.to_string()))?;

        let client = self.session().await?;
        if let Some(info) = &info {
            client.store(REMOTE_STATION_INFO, info.as_bytes()).await?;
        }
        if let Some(total) = &batch.total {
            client.store(REMOTE_TOTAL, total).await?;
        }
        if let Some(detail) = &batch.detail {
            client.store(REMOTE_DETAIL, detail).await?;
        }
        client.store(REMOTE_STATUS, status.as_bytes()).await?;

        match client.retrieve(REMOTE_COMMAND).await {
            Ok(bytes) => match config::parse_remote_command(&bytes) {
                Ok(cmd) => Ok(Some(cmd)),
                Err(e) => {
                    warn!("Ignoring unreadable remote command: {}", e);
                    Ok(None)
                }
            },
            Err(TransferError::NotFound(_)) => Ok(None),
            Err(e) => {
                debug!("No remote command this cycle: {}", e);
                if e.is_connection() {
                    self.client = None;
                }
                Ok(None)
            }
        }
    }
}

impl Transport for SessionTransport {
    fn name(&self) -> &'static str {
        "ftp"
    }

    async fn deliver(&mut self, batch: &Batch) -> Result<Option<RemoteCommand>, TransferError> {
        match self.send_batch(batch).await {
            Ok(cmd) => Ok(cmd),
            Err(e) if e.is_connection() => {
                warn!("Session lost ({}), reconnecting once", e);
                self.client = None;
                let retried = self.send_batch(batch).await;
                if retried.is_err() {
                    self.client = None;
                }
                retried
            }
            Err(e) => {
                self.client = None;
                Err(e)
            }
        }
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            client.quit().await;
            debug!("File-transfer session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusRecord;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    #[test]
    fn pasv_reply_is_parsed() {
        let addr = parse_pasv("Entering Passive Mode (192,168,1,20,195,80).").unwrap();
        assert_eq!(addr, "192.168.1.20:50000".parse().unwrap());
        assert!(parse_pasv("Entering Passive Mode").is_err());
        assert!(parse_pasv("Entering Passive Mode (1,2,3)").is_err());
    }

    #[test]
    fn reply_codes() {
        assert_eq!(reply_code("226 Transfer complete\r\n").unwrap(), 226);
        assert!(reply_code("hello").is_err());
    }

    type Files = Arc<Mutex<HashMap<String, Vec<u8>>>>;

    /// Serves one control connection at a time from an in-memory directory.
    async fn fake_server(files: Files) -> (u16, Arc<Mutex<u32>>) {
        fake_server_with_idle_outs(files, 0).await
    }

    /// Like [`fake_server`], but the first `idle_outs` sessions are closed
    /// with `421` at their first `PASV`.
    async fn fake_server_with_idle_outs(files: Files, idle_outs: u32) -> (u16, Arc<Mutex<u32>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let logins = Arc::new(Mutex::new(0));
        let counter = logins.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                let n = {
                    let mut count = counter.lock().unwrap();
                    *count += 1;
                    *count
                };
                tokio::spawn(serve(stream, files.clone(), n <= idle_outs));
            }
        });
        (port, logins)
    }

    async fn serve(stream: TcpStream, files: Files, idle_out: bool) {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let mut data: Option<TcpListener> = None;
        write.write_all(b"220 ready\r\n").await.unwrap();
        while let Ok(Some(line)) = lines.next_line().await {
            let (cmd, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
            let reply = match cmd {
                "USER" => "331 password please".to_string(),
                "PASS" => "230 welcome".to_string(),
                "TYPE" => "200 binary".to_string(),
                "PASV" if idle_out => {
                    write
                        .write_all(b"421 Timeout, closing control connection\r\n")
                        .await
                        .unwrap();
                    return;
                }
                "PASV" => {
                    let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
                    let p = l.local_addr().unwrap().port();
                    data = Some(l);
                    format!("227 Entering Passive Mode (127,0,0,1,{},{})", p >> 8, p & 0xff)
                }
                "STOR" => {
                    write.write_all(b"150 go\r\n").await.unwrap();
                    let (mut conn, _) = data.take().unwrap().accept().await.unwrap();
                    let mut buf = Vec::new();
                    conn.read_to_end(&mut buf).await.unwrap();
                    files.lock().unwrap().insert(arg.to_string(), buf);
                    "226 stored".to_string()
                }
                "RETR" => {
                    let content = files.lock().unwrap().get(arg).cloned();
                    match content {
                        None => "550 no such file".to_string(),
                        Some(bytes) => {
                            write.write_all(b"150 go\r\n").await.unwrap();
                            let (mut conn, _) = data.take().unwrap().accept().await.unwrap();
                            conn.write_all(&bytes).await.unwrap();
                            drop(conn);
                            "226 sent".to_string()
                        }
                    }
                }
                "QUIT" => {
                    write.write_all(b"221 bye\r\n").await.unwrap();
                    return;
                }
                _ => "502 not implemented".to_string(),
            };
            write.write_all(format!("{}\r\n", reply).as_bytes()).await.unwrap();
        }
    }

    fn settings(port: u16) -> TransportConfig {
        TransportConfig {
            host: "127.0.0.1".to_string(),
            port,
            timeout_secs: 5,
            ..TransportConfig::default()
        }
    }

    fn batch(total: Option<&[u8]>) -> Batch {
        Batch {
            station_info: None,
            total: total.map(|b| b.to_vec()),
            detail: None,
            status: StatusRecord::startup(),
        }
    }

    #[tokio::test]
    async fn session_stores_artifacts_and_reuses_the_connection() {
        let files = Files::default();
        let (port, logins) = fake_server(files.clone()).await;
        let mut transport = SessionTransport::new(settings(port));

        let cmd = transport.deliver(&batch(Some(b"jpeg"))).await.unwrap();
        assert_eq!(cmd, None);
        transport.deliver(&batch(None)).await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(*logins.lock().unwrap(), 1);

        let stored = files.lock().unwrap();
        assert_eq!(stored.get(REMOTE_TOTAL).map(Vec::as_slice), Some(&b"jpeg"[..]));
        assert!(stored.contains_key(REMOTE_STATUS));
        assert!(!stored.contains_key(REMOTE_DETAIL));
        drop(stored);

        transport.close().await;
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn remote_command_is_fetched_after_the_batch() {
        let files = Files::default();
        files.lock().unwrap().insert(
            REMOTE_COMMAND.to_string(),
            b"[Command]\ncamoffline = 0\nperiodm = 3\nseries = 1\nzoommove = 0\nzoomdrawrect = 1\n\n[Detail]\nzoomcentpercx = 5\nzoomcentpercy = -5\n".to_vec(),
        );
        let (port, _) = fake_server(files).await;
        let mut transport = SessionTransport::new(settings(port));

        let cmd = transport.deliver(&batch(None)).await.unwrap().unwrap();
        assert_eq!(cmd.period_m, 3);
        assert!(cmd.series);
        assert_eq!(cmd.zoom_center_perc_y, -5);
    }

    #[tokio::test]
    async fn idled_out_session_reconnects_and_delivers() {
        let files = Files::default();
        let (port, logins) = fake_server_with_idle_outs(files.clone(), 1).await;
        let mut transport = SessionTransport::new(settings(port));

        let cmd = transport.deliver(&batch(Some(b"jpeg"))).await.unwrap();
        assert_eq!(cmd, None);
        assert!(transport.is_connected());
        assert_eq!(*logins.lock().unwrap(), 2);
        assert_eq!(
            files.lock().unwrap().get(REMOTE_TOTAL).map(Vec::as_slice),
            Some(&b"jpeg"[..])
        );
    }

    #[tokio::test]
    async fn service_closing_reply_is_a_connection_error() {
        let files = Files::default();
        let (port, _) = fake_server_with_idle_outs(files, 2).await;
        let mut transport = SessionTransport::new(settings(port));

        let err = transport.deliver(&batch(None)).await.unwrap_err();
        assert!(err.is_connection(), "{err}");
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn unreachable_collector_fails_after_one_retry() {
        // bind then drop to get a port nobody listens on
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let mut transport = SessionTransport::new(settings(port));
        let err = transport.deliver(&batch(None)).await.unwrap_err();
        assert!(err.is_connection());
        assert!(!transport.is_connected());
    }
}
