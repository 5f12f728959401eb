//! End-to-end webhook deploy through the router, with `git` and `npm`
//! replaced by scripts that record their arguments.
//!
//! Kept in its own test binary because it changes `PATH` for the process.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use easy_pm::config::parse_config;
use easy_pm::router::{Router, RouterServer, Site};
use easy_pm::runas::RunAs;
use easy_pm::webhook::{sign, Deployer, SIGNATURE_HEADER};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

fn install_fake_tool(bin: &Path, name: &str) {
    let path = bin.join(name);
    std::fs::write(
        &path,
        format!("#!/bin/sh\necho \"{} $*\" >> deploy.log\n", name),
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

async fn post_hook(addr: std::net::SocketAddr, path: &str, body: &str, signature: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "POST {} HTTP/1.1\r\nHost: hooks.example.com\r\nContent-Length: {}\r\n{}: {}\r\nConnection: close\r\n\r\n{}",
        path,
        body.len(),
        SIGNATURE_HEADER,
        signature,
        body
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn wait_for_log(path: &Path, lines: usize) -> Option<String> {
    for _ in 0..100 {
        if let Ok(log) = std::fs::read_to_string(path) {
            if log.lines().count() >= lines {
                return Some(log);
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}

#[tokio::test]
async fn test_signed_hook_runs_deploy_steps() {
    let dir = tempfile::tempdir().unwrap();

    let bin = dir.path().join("bin");
    std::fs::create_dir(&bin).unwrap();
    install_fake_tool(&bin, "git");
    install_fake_tool(&bin, "npm");
    let path = std::env::var("PATH").unwrap_or_default();
    std::env::set_var("PATH", format!("{}:{}", bin.display(), path));

    let apps = dir.path().join("apps");
    std::fs::create_dir_all(apps.join("blog")).unwrap();
    std::fs::create_dir_all(apps.join("shop")).unwrap();

    let config = parse_config(
        &dir.path().join("epm.json"),
        r#"{
            "root": "./apps",
            "webhook": {"token": "hook-secret"},
            "apps": [
                {"name": "blog", "branch": "production"},
                {"name": "shop"}
            ]
        }"#,
    )
    .unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let router = Arc::new(Router::new(
        vec![Site::new(config)],
        Deployer::new(RunAs::CurrentUser),
    ));
    let server = RouterServer::bind("127.0.0.1:0".parse().unwrap(), router, shutdown_rx)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let body = r#"{"ref":"refs/heads/production"}"#;

    let signature = format!("sha1={}", sign("hook-secret", body.as_bytes()));

    // Wrong signature: nothing runs
    let response = post_hook(addr, "/hooks/shop", body, "sha1=deadbeef").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");

    // Valid signature with one bit flipped anywhere in the header value
    for index in 0..signature.len() {
        let mut mutated = signature.clone().into_bytes();
        mutated[index] ^= 1;
        let mutated = String::from_utf8(mutated).unwrap();
        let response = post_hook(addr, "/hooks/shop", body, &mutated).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    }

    let response = post_hook(addr, "/hooks/blog/", body, &signature).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");

    let log = wait_for_log(&apps.join("blog").join("deploy.log"), 3)
        .await
        .expect("deploy steps should run in the app directory");
    assert_eq!(log, "git pull\ngit checkout production\nnpm install\n");

    // Give a stray deploy for the rejected hook time to show up
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!apps.join("shop").join("deploy.log").exists());
}
