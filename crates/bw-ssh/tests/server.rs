//! End-to-end tests of the embedded SSH server over in-memory streams

use std::sync::Arc;
use std::time::Duration;

use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{client, Channel, ChannelId, ChannelMsg, CryptoVec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bw_ssh::server::generate_host_key;
use bw_ssh::{ServerOptions, SessionMode, SshClient, SshError, SshServer};

fn local_options(shell: &str) -> ServerOptions {
    ServerOptions {
        shell: vec![shell.to_string()],
        workdir: None,
        current_user: bw_core::user::current_username(),
        authorized_keys: Vec::new(),
        mode: SessionMode::Local,
    }
}

fn spawn_server(options: ServerOptions) -> tokio::io::DuplexStream {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = SshServer::new(
        generate_host_key().unwrap(),
        options,
        Duration::from_millis(10),
        tracing::Span::none(),
    );
    tokio::spawn(async move { server.serve_connection(server_io, "test".to_string()).await });
    client_io
}

async fn connect_to(options: ServerOptions) -> SshClient {
    let client_io = spawn_server(options);

    SshClient::connect(
        client_io,
        &bw_core::user::current_username(),
        tracing::Span::none(),
    )
    .await
    .unwrap()
}

async fn run(client: &SshClient, command: &str, stdin: &[u8]) -> (Result<(), SshError>, String, String) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        client.run(command, stdin, &mut stdout, &mut stderr),
    )
    .await
    .expect("command timed out");
    (
        result,
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    )
}

#[tokio::test]
async fn test_exec_reports_output_and_exit_code() {
    let client = connect_to(local_options("/bin/sh")).await;

    let (result, stdout, stderr) = run(&client, "echo hello; echo oops >&2; exit 7", b"").await;
    assert_eq!(stdout, "hello\n");
    assert_eq!(stderr, "oops\n");
    assert!(matches!(result, Err(SshError::ExitCode(7))));
}

#[tokio::test]
async fn test_exec_forwards_stdin() {
    let client = connect_to(local_options("/bin/sh")).await;

    let (result, stdout, _) = run(&client, "cat", b"piped through\n").await;
    assert!(result.is_ok());
    assert_eq!(stdout, "piped through\n");
}

#[tokio::test]
async fn test_spawn_failure_is_reported_on_stderr_with_status_one() {
    let client = connect_to(local_options("/nonexistent/shell")).await;

    let (result, _, stderr) = run(&client, "true", b"").await;
    assert!(matches!(result, Err(SshError::ExitCode(1))));
    assert!(stderr.contains("/nonexistent/shell"));
}

#[tokio::test]
async fn test_address_in_use_is_not_an_error() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = occupied.local_addr().unwrap().to_string();

    let server = SshServer::new(
        generate_host_key().unwrap(),
        local_options("/bin/sh"),
        Duration::from_millis(10),
        tracing::Span::none(),
    );
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        server.listen_and_serve(&address, CancellationToken::new()),
    )
    .await
    .unwrap();
    assert!(result.is_ok());
}

/// Inner server whose every exec prints a line and exits with a fixed code
struct FixedExit {
    code: u32,
}

impl Handler for FixedExit {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        let handle = session.handle();
        let code = self.code;
        tokio::spawn(async move {
            let _ = handle
                .data(channel, CryptoVec::from_slice(b"from inner\n"))
                .await;
            let _ = handle.exit_status_request(channel, code).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
        });
        Ok(())
    }
}

async fn inner_client(code: u32) -> SshClient {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let mut config = russh::server::Config::default();
    config.keys.push(generate_host_key().unwrap());
    let config = Arc::new(config);

    tokio::spawn(async move {
        if let Ok(session) = russh::server::run_stream(config, server_io, FixedExit { code }).await {
            let _ = session.await;
        }
    });

    SshClient::connect(client_io, "inner", tracing::Span::none())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_proxy_reflects_inner_exit_status() {
    let inner = Arc::new(inner_client(3).await);
    let client = connect_to(local_options("/bin/sh").with_proxy(inner)).await;

    let (result, stdout, _) = run(&client, "whatever", b"").await;
    assert_eq!(stdout, "from inner\n");
    assert!(matches!(result, Err(SshError::ExitCode(3))));
}

#[tokio::test]
async fn test_proxy_success_is_status_zero() {
    let inner = Arc::new(inner_client(0).await);
    let client = connect_to(local_options("/bin/sh").with_proxy(inner)).await;

    let (result, _, _) = run(&client, "whatever", b"").await;
    assert!(result.is_ok());
}

/// Inner server whose exec never ends; reports exec and close events
struct SilentExec {
    events: mpsc::UnboundedSender<&'static str>,
}

impl Handler for SilentExec {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        let _ = self.events.send("exec");
        Ok(())
    }

    async fn channel_close(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self.events.send("close");
        Ok(())
    }
}

#[tokio::test]
async fn test_closing_host_channel_closes_inner_session() {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let mut config = russh::server::Config::default();
    config.keys.push(generate_host_key().unwrap());
    let config = Arc::new(config);
    tokio::spawn(async move {
        let handler = SilentExec { events: events_tx };
        if let Ok(session) = russh::server::run_stream(config, server_io, handler).await {
            let _ = session.await;
        }
    });
    let inner = Arc::new(
        SshClient::connect(client_io, "inner", tracing::Span::none())
            .await
            .unwrap(),
    );

    let client = connect_to(local_options("/bin/sh").with_proxy(inner)).await;
    let channel = client.open_session().await.unwrap();
    channel.exec(true, "sleep forever").await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap();
    assert_eq!(first, Some("exec"));

    channel.close().await.unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("inner session stayed open");
    assert_eq!(closed, Some("close"));
}

/// `/proc` state letter of `pid`, `None` once the process is gone
fn process_state(pid: u32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let after_name = stat.rsplit_once(')')?.1;
    after_name.trim_start().chars().next()
}

async fn wait_for_pid(path: &std::path::Path) -> u32 {
    for _ in 0..100 {
        if let Ok(text) = std::fs::read_to_string(path) {
            if let Ok(pid) = text.trim().parse() {
                return pid;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("command never wrote its pid");
}

async fn assert_process_ends(pid: u32) {
    for _ in 0..40 {
        match process_state(pid) {
            None | Some('Z') => return,
            Some(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    panic!("process {} outlived its session", pid);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_disconnect_kills_running_command() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let client = connect_to(local_options("/bin/sh")).await;

    let channel = client.open_session().await.unwrap();
    let command = format!("echo $$ > {}; exec sleep 30", pid_file.display());
    channel.exec(true, command).await.unwrap();

    let pid = wait_for_pid(&pid_file).await;
    assert!(process_state(pid).is_some());

    client.disconnect().await;
    assert_process_ends(pid).await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_channel_close_kills_pty_command() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let client = connect_to(local_options("/bin/sh")).await;

    let channel = client.open_session().await.unwrap();
    channel
        .request_pty(false, "xterm", 80, 24, 0, 0, &[])
        .await
        .unwrap();
    let command = format!("echo $$ > {}; exec sleep 30", pid_file.display());
    channel.exec(true, command).await.unwrap();

    let pid = wait_for_pid(&pid_file).await;
    channel.close().await.unwrap();
    assert_process_ends(pid).await;
}

/// Collect channel data until the channel closes
async fn collect_output(channel: &mut Channel<client::Msg>) -> String {
    let mut out = Vec::new();
    let drain = async {
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => out.extend_from_slice(data),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), drain)
        .await
        .expect("channel never closed");
    String::from_utf8_lossy(&out).into_owned()
}

#[tokio::test]
async fn test_resize_before_exec_sizes_the_pty() {
    let client = connect_to(local_options("/bin/sh")).await;

    let mut channel = client.open_session().await.unwrap();
    channel
        .request_pty(false, "xterm", 80, 24, 0, 0, &[])
        .await
        .unwrap();
    channel.window_change(100, 30, 0, 0).await.unwrap();
    channel.exec(true, "stty size").await.unwrap();

    let output = collect_output(&mut channel).await;
    assert!(output.contains("30 100"), "unexpected output {:?}", output);
}

#[tokio::test]
async fn test_resize_while_running_reaches_the_pty() {
    let client = connect_to(local_options("/bin/sh")).await;

    let mut channel = client.open_session().await.unwrap();
    channel
        .request_pty(false, "xterm", 80, 24, 0, 0, &[])
        .await
        .unwrap();
    channel.exec(true, "read x; stty size").await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    channel.window_change(120, 40, 0, 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    channel.data(&b"go\n"[..]).await.unwrap();

    let output = collect_output(&mut channel).await;
    assert!(output.contains("40 120"), "unexpected output {:?}", output);
}

/// Client side of reverse forwarding: hands every forwarded socket channel to the test
struct ForwardCatcher {
    channels: mpsc::UnboundedSender<(String, Channel<client::Msg>)>,
}

impl client::Handler for ForwardCatcher {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_streamlocal(
        &mut self,
        channel: Channel<client::Msg>,
        socket_path: &str,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let _ = self.channels.send((socket_path.to_string(), channel));
        Ok(())
    }
}

async fn forwarding_client() -> (
    client::Handle<ForwardCatcher>,
    mpsc::UnboundedReceiver<(String, Channel<client::Msg>)>,
) {
    let client_io = spawn_server(local_options("/bin/sh"));
    let (channels, forwarded) = mpsc::unbounded_channel();
    let config = Arc::new(client::Config::default());
    let mut handle = client::connect_stream(config, client_io, ForwardCatcher { channels })
        .await
        .unwrap();
    let auth = handle
        .authenticate_none(bw_core::user::current_username())
        .await
        .unwrap();
    assert!(auth.success());
    (handle, forwarded)
}

async fn exchange_through_forward(
    path: &std::path::Path,
    forwarded: &mut mpsc::UnboundedReceiver<(String, Channel<client::Msg>)>,
) {
    let mut local = tokio::net::UnixStream::connect(path).await.unwrap();
    let (bound_path, channel) = tokio::time::timeout(Duration::from_secs(5), forwarded.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bound_path, path.to_str().unwrap());

    let mut remote = channel.into_stream();
    local.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    remote.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    remote.write_all(b"pong").await.unwrap();
    remote.flush().await.unwrap();
    local.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
}

#[tokio::test]
async fn test_reverse_socket_forward_carries_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.sock");
    let (mut handle, mut forwarded) = forwarding_client().await;

    handle
        .streamlocal_forward(path.to_str().unwrap())
        .await
        .unwrap();
    exchange_through_forward(&path, &mut forwarded).await;
}

#[tokio::test]
async fn test_rebinding_socket_keeps_new_listener() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.sock");
    let (mut handle, mut forwarded) = forwarding_client().await;

    handle
        .streamlocal_forward(path.to_str().unwrap())
        .await
        .unwrap();
    handle
        .streamlocal_forward(path.to_str().unwrap())
        .await
        .unwrap();

    // the first listener has shut down by now
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(path.exists());
    exchange_through_forward(&path, &mut forwarded).await;
}

#[tokio::test]
async fn test_direct_socket_forward_reaches_server_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("service.sock");
    let listener = tokio::net::UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 5];
            if stream.read_exact(&mut buf).await.is_ok() {
                let _ = stream.write_all(&buf).await;
            }
        }
    });

    let client = connect_to(local_options("/bin/sh")).await;
    let mut stream = client
        .direct_streamlocal(path.to_str().unwrap())
        .await
        .unwrap();
    stream.write_all(b"hello").await.unwrap();
    stream.flush().await.unwrap();
    let mut buf = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn test_agent_forwarding_is_declined() {
    let client = connect_to(local_options("/bin/sh")).await;
    let mut channel = client.open_session().await.unwrap();
    channel.agent_forward(true).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), channel.wait())
        .await
        .unwrap();
    assert!(matches!(reply, Some(ChannelMsg::Failure)), "got {:?}", reply);
}
