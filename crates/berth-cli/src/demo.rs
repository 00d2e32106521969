//! Demonstration flows.

use anyhow::Context;
use berth_core::{ExecRequest, Sandbox, SandboxRegistry};
use std::net::TcpListener;
use std::sync::Arc;

const PRIMARY_SESSION: &str = "demo-session";
const PORTED_SESSION: &str = "demo-session-vnc";

/// Run every demonstration against `registry`.
pub async fn run(registry: &SandboxRegistry) -> anyhow::Result<()> {
    println!("=== Berth sandbox demo ===");
    println!(
        "image: {}, working dir: {}",
        registry.config().image_reference(),
        registry.config().working_dir
    );

    println!("\n1. Creating sandbox for session {PRIMARY_SESSION}");
    let sandbox = registry
        .run(PRIMARY_SESSION, None)
        .await
        .context("failed to create sandbox")?;
    println!("sandbox created: container_id={}", sandbox.container_id());

    println!("\n2. File transfer");
    if let Err(e) = file_transfer(&sandbox).await {
        println!("file transfer failed: {e:#}");
    }

    println!("\n3. Running commands");
    exec_examples(&sandbox).await;

    println!("\n4. Creating sandbox with a published service port");
    let host_port = free_port()?;
    let service_port = registry.config().service_port;
    match registry.run(PORTED_SESSION, Some(host_port)).await {
        Ok(ported) => println!(
            "sandbox created: container_id={}, port {service_port} -> {host_port}",
            ported.container_id()
        ),
        Err(e) => println!("failed to create sandbox: {e}"),
    }

    println!("\n5. Active sandboxes");
    for sandbox in registry.list().await {
        let port = sandbox
            .host_port()
            .map(|p| format!(", host port {p}"))
            .unwrap_or_default();
        println!(
            "  {} -> {} (created {}){port}",
            sandbox.session_id(),
            sandbox.container_id(),
            sandbox.created_at().format("%H:%M:%S")
        );
        if sandbox.host_port().is_some() {
            match registry.port_bindings(sandbox.session_id()).await {
                Ok(bindings) => println!("    port bindings: {bindings:?}"),
                Err(e) => println!("    could not inspect port bindings: {e}"),
            }
        }
    }

    println!("\n6. Removing sandboxes");
    for session_id in registry.sessions().await {
        let removed = registry.remove(&session_id).await;
        println!("  {session_id}: {}", if removed { "removed" } else { "failed" });
    }

    println!("\n=== Demo complete ===");
    Ok(())
}

async fn file_transfer(sandbox: &Arc<Sandbox>) -> anyhow::Result<()> {
    let scratch = tempfile::tempdir()?;
    let upload = scratch.path().join("test_upload.txt");
    std::fs::write(&upload, "Hello from the host!\nThis file travelled into a sandbox.\n")?;

    println!("uploading {} to /tmp", upload.display());
    sandbox.upload_file(&upload, "/tmp").await?;

    println!("contents inside the sandbox:");
    print_output(sandbox, ExecRequest::new(["cat", "/tmp/test_upload.txt"])).await;

    println!("creating a file inside the sandbox");
    print_output(
        sandbox,
        ExecRequest::shell_command(
            "echo 'Created inside the sandbox' > /tmp/sandbox_file.txt && date >> /tmp/sandbox_file.txt",
        ),
    )
    .await;
    print_output(sandbox, ExecRequest::new(["ls", "-la", "/tmp/sandbox_file.txt"])).await;

    let download = scratch.path().join("downloaded_from_sandbox.txt");
    println!("downloading /tmp/sandbox_file.txt to {}", download.display());
    sandbox
        .download_file("/tmp/sandbox_file.txt", &download)
        .await?;
    println!("downloaded contents:\n{}", std::fs::read_to_string(&download)?);

    Ok(())
}

async fn exec_examples(sandbox: &Arc<Sandbox>) {
    println!("simple command:");
    print_output(sandbox, ExecRequest::new(["echo", "Hello from a Berth sandbox"])).await;

    println!("\nwith an environment variable:");
    print_output(
        sandbox,
        ExecRequest::new(["bash", "-c", "echo DEMO_ENV=$DEMO_ENV"]).env("DEMO_ENV", "hello_world"),
    )
    .await;

    println!("\nstreaming output:");
    print_output(
        sandbox,
        ExecRequest::new([
            "bash",
            "-c",
            "for i in 1 2 3 4 5; do echo line $i; sleep 0.2; done",
        ]),
    )
    .await;

    println!("\nwith a working directory:");
    print_output(sandbox, ExecRequest::new(["pwd"]).cwd("/tmp")).await;

    println!("\nthrough the shell:");
    print_output(sandbox, ExecRequest::shell_command("echo listing: && ls -la")).await;
}

async fn print_output(sandbox: &Arc<Sandbox>, request: ExecRequest) {
    let mut handle = sandbox.exec(request).await;
    if let Some(failure) = handle.failure() {
        println!("  could not start command: {}", failure.message);
    }
    while let Some(line) = handle.next_line().await {
        println!("  | {line}");
    }
    println!("  exit code: {}", handle.wait().await);
}

/// Ask the OS for an unused TCP port.
fn free_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind(("0.0.0.0", 0)).context("failed to find a free port")?;
    Ok(listener.local_addr()?.port())
}
