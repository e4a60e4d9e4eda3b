use anyhow::Result;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use p2p_fs::catalog::FileCatalog;
use p2p_fs::networking::{TransferClient, TransferConfig, TransferServer};

struct Node {
    catalog: Arc<FileCatalog>,
    server: TransferServer,
    addr: SocketAddr,
    client: TransferClient,
}

async fn start_node(dir: &Path) -> Result<Node> {
    let catalog = Arc::new(FileCatalog::open(dir)?);
    let config = TransferConfig {
        listen_addr: "127.0.0.1:0".parse()?,
        ..TransferConfig::default()
    };

    let mut server = TransferServer::new(config, catalog.clone());
    let addr = server.start_server(CancellationToken::new()).await?;
    let client = TransferClient::new(addr.port(), catalog.clone());

    Ok(Node { catalog, server, addr, client })
}

#[tokio::test]
async fn catalog_fetch_returns_remote_names() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let remote_dir = tempfile::tempdir()?;
    std::fs::write(remote_dir.path().join("a.txt"), b"alpha")?;
    std::fs::write(remote_dir.path().join("b.txt"), b"beta")?;
    let mut remote = start_node(remote_dir.path()).await?;

    let local_dir = tempfile::tempdir()?;
    std::fs::write(local_dir.path().join("local-only.txt"), b"mine")?;
    let local_catalog = Arc::new(FileCatalog::open(local_dir.path())?);
    let client = TransferClient::new(remote.addr.port(), local_catalog);

    // Bare host: the client dials its configured transfer port
    let files: HashSet<String> = client.request_file_list("127.0.0.1").await?.into_iter().collect();
    let expected: HashSet<String> = ["a.txt", "b.txt"].iter().map(|s| s.to_string()).collect();
    assert_eq!(files, expected);

    // An explicit host:port works too
    let files = remote.client.request_file_list(&remote.addr.to_string()).await?;
    assert_eq!(files.len(), 2);

    remote.server.stop_server().await;
    Ok(())
}

#[tokio::test]
async fn file_fetch_copies_bytes_and_rebuilds_catalog() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let remote_dir = tempfile::tempdir()?;
    let contents: Vec<u8> = (0..1_000_000u32).map(|i| (i * 7 % 256) as u8).collect();
    std::fs::write(remote_dir.path().join("photo.raw"), &contents)?;
    let mut remote = start_node(remote_dir.path()).await?;

    let local_dir = tempfile::tempdir()?;
    let local_catalog = Arc::new(FileCatalog::open(local_dir.path())?);
    let client = TransferClient::new(remote.addr.port(), local_catalog.clone());
    assert!(local_catalog.is_empty());

    let received = client.request_file_download("127.0.0.1", "photo.raw").await?;

    assert_eq!(received, contents.len() as u64);
    assert_eq!(std::fs::read(local_dir.path().join("photo.raw"))?, contents);
    assert!(local_catalog.contains("photo.raw"));

    // The remote side is unchanged
    assert_eq!(remote.catalog.len(), 1);

    remote.server.stop_server().await;
    Ok(())
}

#[tokio::test]
async fn presence_check_needs_no_reply() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut node = start_node(dir.path()).await?;

    node.client.send_ping(&node.addr.to_string()).await?;
    node.client.send_ping(&node.addr.to_string()).await?;

    node.server.stop_server().await;
    Ok(())
}

#[tokio::test]
async fn unknown_command_closes_without_reply() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("kept.txt"), b"still here")?;
    let mut node = start_node(dir.path()).await?;

    let mut stream = TcpStream::connect(node.addr).await?;
    stream.write_all(b"{\"Command\":\"FORMAT_DISK\",\"Payload\":\"\"}\n").await?;
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await?;
    assert!(reply.is_empty());

    // The server keeps accepting unrelated connections
    let files = node.client.request_file_list(&node.addr.to_string()).await?;
    assert_eq!(files, vec!["kept.txt".to_string()]);

    node.server.stop_server().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_downloads_are_independent() -> Result<()> {
    let remote_dir = tempfile::tempdir()?;
    for i in 0..8 {
        std::fs::write(remote_dir.path().join(format!("file{}.bin", i)), vec![i as u8; 10_000 + i])?;
    }
    let mut remote = start_node(remote_dir.path()).await?;

    let local_dir = tempfile::tempdir()?;
    let local_catalog = Arc::new(FileCatalog::open(local_dir.path())?);
    let client = TransferClient::new(remote.addr.port(), local_catalog.clone());

    let mut handles = Vec::new();
    for i in 0..8 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client.request_file_download("127.0.0.1", &format!("file{}.bin", i)).await
        }));
    }
    // One request for a file that does not exist
    let missing = client.request_file_download("127.0.0.1", "absent.bin").await?;
    assert_eq!(missing, 0);

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await??, (10_000 + i) as u64);
    }

    local_catalog.rebuild()?;
    assert_eq!(local_catalog.len(), 9);

    remote.server.stop_server().await;
    Ok(())
}
