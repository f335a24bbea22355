use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_chat_and_file_transfer_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("chat_file_relay");
    let downloads = tempfile::tempdir()?;
    let outgoing = tempfile::NamedTempFile::new()?;
    std::fs::write(outgoing.path(), b"file contents from alice")?;

    let (mut server_child, mut server_stdout) = spawn_server(&binary)?;
    let banner = next_line(&mut server_stdout, "waiting for server banner").await?;
    let addr = banner
        .strip_prefix("relay listening on ")
        .with_context(|| format!("unexpected server banner: {banner}"))?
        .to_string();

    // Keep the server's stdout pipe from filling up.
    let server_log_task = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut server_stdout, &mut tokio::io::sink()).await;
    });

    let mut alice = spawn_client(&binary, "alice", "bob", &addr, downloads.path()).await?;
    let mut bob = spawn_client(&binary, "bob", "alice", &addr, downloads.path()).await?;

    // Alice greets Bob; Bob hears it and Alice gets the echo.
    alice
        .send_line("Hello from Alice")
        .await
        .context("alice send line")?;
    let bob_hears_alice =
        next_line(&mut bob.stdout, "waiting for bob to hear alice").await?;
    assert_eq!(bob_hears_alice, "<alice> Hello from Alice");
    let alice_echo = next_line(&mut alice.stdout, "waiting for alice echo").await?;
    assert_eq!(alice_echo, "<alice> Hello from Alice");

    // Alice sends a small file; Bob writes it into the download directory.
    alice
        .send_line(&format!("/file {}", outgoing.path().display()))
        .await
        .context("alice send file")?;
    let alice_sent = next_line(&mut alice.stdout, "waiting for alice file confirmation").await?;
    assert!(alice_sent.ends_with("in 1 frames"), "unexpected: {alice_sent}");
    let bob_received = next_line(&mut bob.stdout, "waiting for bob file notice").await?;
    let saved = bob_received
        .strip_prefix("*** received file ")
        .context("unexpected file notice")?;
    assert_eq!(std::fs::read(saved)?, b"file contents from alice");

    // A second client claiming Alice's name is turned away.
    let duplicate = Command::new(&binary)
        .args(["client", "--username", "alice", "--server", addr.as_str()])
        .env("RUST_LOG", "off")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    assert!(!duplicate.success());

    alice.send_line("/quit").await.context("alice send quit")?;
    let alice_quit =
        next_line(&mut alice.stdout, "waiting for alice quit confirmation").await?;
    assert_eq!(alice_quit, "*** leaving chat");

    bob.send_line("/quit").await.context("bob send quit")?;
    let bob_quit = next_line(&mut bob.stdout, "waiting for bob quit confirmation").await?;
    assert_eq!(bob_quit, "*** leaving chat");

    for (mut client, name) in [(alice, "alice"), (bob, "bob")] {
        let status = client.child.wait().await?;
        assert!(status.success(), "{name} exited with {status}");
    }

    // The server keeps running after clients leave; terminate it manually.
    let _ = server_child.kill().await;
    let _ = server_child.wait().await;
    let _ = server_log_task.await;

    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin.write_all(format!("{line}\n").as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

fn spawn_server(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut child = Command::new(binary)
        .args(["server", "--listen", "127.0.0.1:0"])
        .env("RUST_LOG", "off")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn server")?;
    let stdout = child.stdout.take().context("server stdout missing")?;
    Ok((child, BufReader::new(stdout)))
}

async fn spawn_client(
    binary: &Path,
    username: &str,
    peer: &str,
    addr: &str,
    download_dir: &Path,
) -> Result<ClientProcess> {
    let mut child = Command::new(binary)
        .args(["client", "--username", username, "--peer", peer, "--server", addr])
        .arg("--download-dir")
        .arg(download_dir)
        .env("RUST_LOG", "off")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn client {username}"))?;

    let stdin = child.stdin.take().context("client stdin missing")?;
    let stdout = child.stdout.take().context("client stdout missing")?;
    let mut process = ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    };

    let welcome = next_line(&mut process.stdout, "waiting for welcome banner").await?;
    if welcome != format!("*** connected as {username}") {
        bail!("expected welcome banner for {username}, got '{welcome}'");
    }
    Ok(process)
}

async fn next_line(reader: &mut BufReader<ChildStdout>, description: &str) -> Result<String> {
    let mut line = String::new();
    let bytes = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .with_context(|| format!("{description}: timed out"))??;
    if bytes == 0 {
        bail!("{description}: stream closed");
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
