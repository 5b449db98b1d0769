use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use termdeck_protocol::{
    CreateParams, DaemonEvent, DaemonRequest, LiveSession, MAX_JSON_LINE_BYTES, paths,
};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::{Instant, sleep, timeout};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

struct TestDaemon {
    _runtime: TempDir,
    discovery: PathBuf,
    port: u16,
    child: Child,
}

impl TestDaemon {
    async fn spawn() -> Result<Self> {
        Self::spawn_with_args(&[]).await
    }

    async fn spawn_with_args(extra_args: &[&str]) -> Result<Self> {
        let runtime = tempfile::tempdir().context("failed to create temp runtime dir")?;
        let discovery = runtime.path().join("daemon.json");

        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("termdeck-daemon"));
        cmd.arg("--discovery")
            .arg(&discovery)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        for arg in extra_args {
            cmd.arg(arg);
        }
        let child = cmd.spawn().context("failed to spawn termdeck-daemon")?;

        let start = Instant::now();
        let info = loop {
            if let Ok(Some(info)) = paths::read_discovery(&discovery) {
                break info;
            }
            if start.elapsed() > Duration::from_secs(5) {
                bail!("timed out waiting for {}", discovery.display());
            }
            sleep(Duration::from_millis(20)).await;
        };

        Ok(Self {
            _runtime: runtime,
            discovery,
            port: info.port,
            child,
        })
    }

    async fn connect(&self) -> Result<Client> {
        let stream = TcpStream::connect(("127.0.0.1", self.port))
            .await
            .context("connect to daemon")?;
        let (read_half, write_half) = stream.into_split();
        Ok(Client {
            reader: FramedRead::new(
                read_half,
                LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
            ),
            writer: FramedWrite::new(
                write_half,
                LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
            ),
            backlog: Vec::new(),
        })
    }

    async fn wait_exit(&mut self) -> Result<()> {
        let start = Instant::now();
        while self.child.try_wait()?.is_none() {
            if start.elapsed() > Duration::from_secs(5) {
                bail!("daemon did not exit");
            }
            sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

struct Client {
    reader: FramedRead<OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
    /// Events read while waiting for something else, in arrival order.
    backlog: Vec<DaemonEvent>,
}

impl Client {
    async fn send(&mut self, req: &DaemonRequest) -> Result<()> {
        self.writer.send(serde_json::to_string(req)?).await?;
        Ok(())
    }

    async fn send_raw(&mut self, line: &str) -> Result<()> {
        self.writer.send(line.to_string()).await?;
        Ok(())
    }

    async fn read_event(&mut self) -> Result<DaemonEvent> {
        let line = timeout(Duration::from_secs(5), self.reader.next())
            .await
            .context("timed out waiting for event")?
            .context("connection closed")??;
        Ok(serde_json::from_str(&line)?)
    }

    async fn recv(&mut self) -> Result<DaemonEvent> {
        if !self.backlog.is_empty() {
            return Ok(self.backlog.remove(0));
        }
        self.read_event().await
    }

    /// First event matching `pred`; anything else is kept in the backlog.
    async fn recv_until(&mut self, pred: impl Fn(&DaemonEvent) -> bool) -> Result<DaemonEvent> {
        if let Some(pos) = self.backlog.iter().position(&pred) {
            return Ok(self.backlog.remove(pos));
        }
        loop {
            let event = self.read_event().await?;
            if pred(&event) {
                return Ok(event);
            }
            self.backlog.push(event);
        }
    }

    async fn create(&mut self, id: &str, script: &str) -> Result<()> {
        self.send(&DaemonRequest::Create(sh(id, script))).await?;
        let event = self
            .recv_until(|e| matches!(e, DaemonEvent::Created { .. } | DaemonEvent::Error { .. }))
            .await?;
        match event {
            DaemonEvent::Created { id: created } if created == id => Ok(()),
            other => bail!("create {id} failed: {other:?}"),
        }
    }

    async fn attach(&mut self, id: &str, buffer_offset: usize) -> Result<()> {
        self.send(&DaemonRequest::Attach {
            id: id.to_string(),
            buffer_offset,
        })
        .await
    }

    async fn input(&mut self, id: &str, data: &str) -> Result<()> {
        self.send(&DaemonRequest::Input {
            id: id.to_string(),
            data: data.to_string(),
        })
        .await
    }

    async fn list(&mut self) -> Result<Vec<LiveSession>> {
        self.send(&DaemonRequest::List).await?;
        match self
            .recv_until(|e| matches!(e, DaemonEvent::ListResult { .. }))
            .await?
        {
            DaemonEvent::ListResult { terminals } => Ok(terminals),
            other => bail!("unexpected event: {other:?}"),
        }
    }

    async fn wait_for_buffer(&mut self, id: &str, len: usize) -> Result<()> {
        let start = Instant::now();
        loop {
            let live = self.list().await?;
            if live.iter().any(|s| s.id == id && s.buffer_length >= len) {
                return Ok(());
            }
            if start.elapsed() > Duration::from_secs(5) {
                bail!("{id} never reached {len} chars: {live:?}");
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Collect streamed output for `id` until it contains `needle`.
    async fn read_output_until(&mut self, id: &str, needle: &str) -> Result<String> {
        let mut seen = String::new();
        while !seen.contains(needle) {
            match self.recv().await? {
                DaemonEvent::Data { id: eid, data } if eid == id => seen.push_str(&data),
                DaemonEvent::ListResult { .. } => {}
                other => bail!("unexpected event: {other:?}"),
            }
        }
        Ok(seen)
    }
}

fn sh(id: &str, script: &str) -> CreateParams {
    CreateParams {
        id: id.to_string(),
        shell: "/bin/sh".to_string(),
        shell_args: vec!["-c".to_string(), script.to_string()],
        cwd: None,
        env: BTreeMap::new(),
        cols: 80,
        rows: 24,
    }
}

fn data_for(events: &[DaemonEvent], id: &str) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            DaemonEvent::Data { id: eid, data } if eid == id => Some(data.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn discovery_file_names_live_daemon() -> Result<()> {
    let daemon = TestDaemon::spawn().await?;
    let info = paths::read_discovery(&daemon.discovery)?.context("discovery missing")?;
    assert_eq!(info.pid, daemon.child.id());
    assert_ne!(info.port, 0);
    Ok(())
}


#[tokio::test]
async fn attach_replays_buffer_once_then_streams_live() -> Result<()> {
    let daemon = TestDaemon::spawn().await?;
    let mut client = daemon.connect().await?;

    client
        .create("t1", "printf hello; read line; printf \"[$line]\"; sleep 5")
        .await?;
    client.wait_for_buffer("t1", 5).await?;

    client.attach("t1", 0).await?;
    assert_eq!(
        client.recv().await?,
        DaemonEvent::Data {
            id: "t1".to_string(),
            data: "hello".to_string()
        }
    );

    client.input("t1", "more\n").await?;
    let streamed = client.read_output_until("t1", "[more]").await?;
    assert!(!streamed.contains("hello"), "hello replayed twice: {streamed:?}");
    Ok(())
}

#[tokio::test]
async fn attach_with_offset_replays_only_the_delta() -> Result<()> {
    let daemon = TestDaemon::spawn().await?;
    let mut client = daemon.connect().await?;
    client.create("t2", "printf abcdef; sleep 5").await?;
    client.wait_for_buffer("t2", 6).await?;

    client.attach("t2", 4).await?;
    assert_eq!(
        client.recv().await?,
        DaemonEvent::Data {
            id: "t2".to_string(),
            data: "ef".to_string()
        }
    );
    Ok(())
}

#[tokio::test]
async fn buffer_keeps_only_the_newest_output() -> Result<()> {
    let daemon = TestDaemon::spawn_with_args(&["--buffer-limit", "10"]).await?;
    let mut client = daemon.connect().await?;
    client.create("b", "printf 0123456789ABCDE; sleep 5").await?;
    client.wait_for_buffer("b", 9).await?;
    sleep(Duration::from_millis(200)).await;

    client.attach("b", 0).await?;
    assert_eq!(
        client.recv().await?,
        DaemonEvent::Data {
            id: "b".to_string(),
            data: "6789ABCDE".to_string()
        }
    );
    Ok(())
}

#[tokio::test]
async fn duplicate_create_acknowledges_without_respawning() -> Result<()> {
    let daemon = TestDaemon::spawn().await?;
    let mut client = daemon.connect().await?;
    client.create("x", "echo a; sleep 5").await?;
    client.create("x", "echo b; sleep 5").await?;
    assert_eq!(client.list().await?.len(), 1);

    client.wait_for_buffer("x", 1).await?;
    sleep(Duration::from_millis(200)).await;
    client.attach("x", 0).await?;
    let DaemonEvent::Data { data, .. } = client.recv().await? else {
        bail!("expected replay");
    };
    assert!(data.contains('a'), "{data:?}");
    assert!(!data.contains('b'), "{data:?}");
    Ok(())
}

#[tokio::test]
async fn list_reports_buffer_lengths() -> Result<()> {
    let daemon = TestDaemon::spawn().await?;
    let mut client = daemon.connect().await?;
    client.create("three", "printf abc; sleep 5").await?;
    client.create("seven", "printf abcdefg; sleep 5").await?;
    client.wait_for_buffer("three", 3).await?;
    client.wait_for_buffer("seven", 7).await?;

    let mut live = client.list().await?;
    live.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(
        live,
        vec![
            LiveSession {
                id: "seven".to_string(),
                buffer_length: 7
            },
            LiveSession {
                id: "three".to_string(),
                buffer_length: 3
            },
        ]
    );
    Ok(())
}

#[tokio::test]
async fn shutdown_ack_arrives_before_close() -> Result<()> {
    let mut daemon = TestDaemon::spawn().await?;
    let mut client = daemon.connect().await?;
    client.create("s", "sleep 30").await?;

    client.send(&DaemonRequest::Shutdown).await?;
    let ack = client
        .recv_until(|e| matches!(e, DaemonEvent::ShutdownAck))
        .await?;
    assert_eq!(ack, DaemonEvent::ShutdownAck);

    let next = timeout(Duration::from_secs(5), client.reader.next())
        .await
        .context("connection stayed open after shutdown_ack")?;
    assert!(matches!(next, None | Some(Err(_))), "{next:?}");

    daemon.wait_exit().await?;
    assert!(!daemon.discovery.exists(), "discovery file left behind");
    Ok(())
}

#[tokio::test]
async fn exit_is_reported_without_attach() -> Result<()> {
    let daemon = TestDaemon::spawn().await?;
    let mut client = daemon.connect().await?;
    client.create("e", "exit 7").await?;

    let exit = client
        .recv_until(|e| matches!(e, DaemonEvent::Exit { .. }))
        .await?;
    assert_eq!(
        exit,
        DaemonEvent::Exit {
            id: "e".to_string(),
            code: Some(7)
        }
    );
    assert!(client.list().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn spawn_failure_reports_error_with_id() -> Result<()> {
    let daemon = TestDaemon::spawn().await?;
    let mut client = daemon.connect().await?;
    let mut params = sh("bad", "true");
    params.shell = "/no/such/shell".to_string();
    client.send(&DaemonRequest::Create(params)).await?;

    match client.recv().await? {
        DaemonEvent::Error { id, .. } => assert_eq!(id.as_deref(), Some("bad")),
        other => bail!("unexpected event: {other:?}"),
    }
    assert!(client.list().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn malformed_lines_are_ignored() -> Result<()> {
    let daemon = TestDaemon::spawn().await?;
    let mut client = daemon.connect().await?;
    client.send_raw("{not json").await?;
    client.send_raw(r#"{"type":"warp"}"#).await?;
    assert!(client.list().await?.is_empty());
    assert!(client.backlog.is_empty());
    Ok(())
}

#[tokio::test]
async fn new_connection_replaces_old_and_starts_unsubscribed() -> Result<()> {
    let daemon = TestDaemon::spawn().await?;
    let mut first = daemon.connect().await?;
    first
        .create(
            "r",
            "read line; printf \"<$line>\"; read line; printf \"<$line>\"; sleep 5",
        )
        .await?;
    first.attach("r", 0).await?;
    // Round-trip so the attach is processed before the takeover.
    first.list().await?;

    let mut second = daemon.connect().await?;
    let next = timeout(Duration::from_secs(5), first.reader.next())
        .await
        .context("old connection stayed open")?;
    assert!(matches!(next, None | Some(Err(_))), "{next:?}");

    second.input("r", "one\n").await?;
    // "one\r\n" echo plus "<one>".
    second.wait_for_buffer("r", 10).await?;
    assert!(data_for(&second.backlog, "r").is_empty());

    second.attach("r", 0).await?;
    second.input("r", "two\n").await?;
    let seen = second.read_output_until("r", "<two>").await?;
    assert_eq!(seen.matches("<one>").count(), 1, "{seen:?}");
    Ok(())
}
