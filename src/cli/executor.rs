use std::fs::OpenOptions;
use std::process::Stdio;
use std::sync::Arc;
use std::{fmt, future::Future};

use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};

use crate::hosts;
use crate::retry_operation;
use crate::utils::{rule, truncate_error_message};

/// A child session to run against one host.
#[derive(Debug)]
pub struct Task {
    pub host: String,
    /// Arguments of the child, options first.
    pub args: Vec<String>,
}

impl Task {
    /// Host without credentials, used for log file names.
    pub fn address(&self) -> String {
        hosts::parse_host_string(&self.host)
            .map(|spec| spec.host)
            .unwrap_or_else(|| self.host.clone())
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match hosts::parse_host_string(&self.host) {
            Some(spec) => write!(f, "{}", spec),
            None => write!(f, "{}", self.host),
        }
    }
}

/// List all host tasks
pub fn list_tasks(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("📝 No hosts to process");
        return;
    }

    println!("\n🎯 Target Hosts ({})", tasks.len());
    println!("{}", rule());

    for (i, task) in tasks.iter().enumerate() {
        println!("{:2} - {}", i + 1, task);
    }

    println!("{}", rule());
}

/// One task per host, each child receiving `options` then its own items.
pub fn build_tasks(hosts: &[String], options: &[String], items: impl Fn(&str) -> Vec<String>) -> Vec<Task> {
    hosts
        .iter()
        .map(|host| Task {
            host: host.clone(),
            args: options.iter().cloned().chain(items(host)).collect(),
        })
        .collect()
}

/// Generic concurrent task executor using producer-consumer pattern.
/// `progress` advances once per task, after its last attempt.
pub async fn execute_tasks<F, Fut>(
    thread_num: usize,
    max_retry: u32,
    tasks: Vec<Task>,
    progress: Arc<ProgressBar>,
    executor: F,
) -> Result<()>
where
    F: Fn(usize, Arc<Task>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    if tasks.is_empty() {
        return Ok(());
    }

    let thread_num = thread_num.clamp(1, tasks.len());

    let (sender, receiver) = mpsc::channel(tasks.len());
    let receiver = Arc::new(Mutex::new(receiver));
    let executor = Arc::new(executor);

    log::info!(
        "Starting execution with {} workers for {} hosts",
        thread_num,
        tasks.len()
    );

    let mut handles = vec![];
    for _ in 0..thread_num {
        let receiver = Arc::clone(&receiver);
        let executor = Arc::clone(&executor);
        let progress = Arc::clone(&progress);

        handles.push(tokio::spawn(async move {
            task_worker(max_retry, executor, receiver, progress).await;
        }));
    }

    for (idx, task) in tasks.into_iter().enumerate() {
        sender.send((idx, task)).await?;
    }
    drop(sender);

    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}

/// Worker function that processes tasks from the channel
async fn task_worker<F, Fut>(
    max_retry: u32,
    executor: Arc<F>,
    receiver: Arc<Mutex<mpsc::Receiver<(usize, Task)>>>,
    progress: Arc<ProgressBar>,
) where
    F: Fn(usize, Arc<Task>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    loop {
        let (idx, task) = match receiver.lock().await.recv().await {
            Some((idx, task)) => (idx, task),
            None => break,
        };

        let task = Arc::new(task);
        let log_prefix = format!("Host '{}'", task);

        let _ = retry_operation!(max_retry, executor(idx, task.clone()).await, log_prefix);
        progress.inc(1);
    }
}

/// Progress bar counting finished hosts.
pub fn progress_bar(total: usize) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    if let Ok(style) = ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} hosts {msg}") {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}

/// Run this executable again for one host. Silent children append to
/// `<host>.log`; otherwise their output is printed once they finish.
pub async fn run_child(task: Arc<Task>, silent: bool, pb: Arc<ProgressBar>) -> Result<()> {
    let exe = std::env::current_exe().context("Failed to locate the recite executable")?;
    let mut command = Command::new(exe);
    command.args(&task.args).stdin(Stdio::null());

    if silent {
        let path = format!("{}.log", task.address());
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path))?;
        command.stdout(Stdio::from(file.try_clone()?)).stderr(Stdio::from(file));
    }

    pb.set_message(format!("started {}", task));
    let output = command
        .output()
        .await
        .with_context(|| format!("Failed to start session for {}", task))?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    let ok = output.status.success();
    let mark = if ok { "✅" } else { "❌" };
    pb.println(format!("{} {} - {}", mark, task, if ok { "Completed" } else { "Failed" }));
    if !silent {
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            pb.println(format!("   {}", line));
        }
    }

    if ok {
        Ok(())
    } else {
        Err(anyhow!(
            "Session failed on {} (exit code: {}){}",
            task,
            output.status.code().unwrap_or(-1),
            if silent {
                String::new()
            } else {
                format!(": {}", truncate_error_message(&text, 3))
            }
        ))
    }
}
