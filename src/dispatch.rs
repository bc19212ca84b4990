//! # 工作线程派发器
//!
//! 固定大小的线程池消费一个无界 FIFO 任务队列。提交的命令行按
//! 命令名分类：只读命令（`ls`、`cat`、`info`）在派发器的共享锁下
//! 执行，其余一律独占。结果经由通道送回提交者，作用同 future。
//!
//! 池停止后拒绝新任务；析构时唤醒并汇合全部工作线程，
//! 在途任务跑完为止。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::{Condvar, Mutex, RwLock};
use std::thread;

use log::error;

use crate::layout::ModeFlag;
use crate::FsError;
use crate::MindFileSystem;
use crate::OpenMode;

/// 派发器默认的工作线程数
pub const DEFAULT_WORKERS: usize = 4;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct ThreadPool {
    workers: Vec<thread::JoinHandle<()>>,
    shared: Arc<PoolShared>,
}

struct PoolShared {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    stop: AtomicBool,
}

impl ThreadPool {
    /// `num_threads` 为 0 时取机器的并行度。
    pub fn new(num_threads: usize) -> Self {
        let num_threads = if num_threads == 0 {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(DEFAULT_WORKERS)
        } else {
            num_threads
        };

        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let workers = (0..num_threads)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || worker_loop(&shared))
            })
            .collect();

        Self { workers, shared }
    }

    /// 提交一个任务。池已停止时拒绝。
    pub fn execute<F>(&self, job: F) -> Result<(), FsError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.stop.load(Ordering::Acquire) {
            error!("enqueue on stopped thread pool");
            return Err(FsError::InvalidArgument);
        }

        self.shared.queue.lock().unwrap().push_back(Box::new(job));
        self.shared.available.notify_one();
        Ok(())
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.available.notify_all();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                if shared.stop.load(Ordering::Acquire) {
                    return;
                }
                queue = shared.available.wait(queue).unwrap();
            }
        };
        job();
    }
}

/// 命令的并发级别。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Shared,
    Exclusive,
}

/// 把命令行排进工作线程池，在读写锁纪律下对文件系统执行。
pub struct Dispatcher {
    fs: Arc<MindFileSystem>,
    gate: Arc<RwLock<()>>,
    pool: ThreadPool,
}

impl Dispatcher {
    /// `num_threads` 为 0 时用默认线程数（[`DEFAULT_WORKERS`]）。
    pub fn new(fs: Arc<MindFileSystem>, num_threads: usize) -> Self {
        let num_threads = if num_threads == 0 {
            DEFAULT_WORKERS
        } else {
            num_threads
        };
        Self {
            fs,
            gate: Arc::new(RwLock::new(())),
            pool: ThreadPool::new(num_threads),
        }
    }

    /// 异步执行一条命令行；结果（0 成功 / 1 失败）从返回的通道取。
    pub fn execute_async(&self, command_line: &str) -> Result<mpsc::Receiver<i32>, FsError> {
        let mode = resolve_mode(command_line);
        let (sender, receiver) = mpsc::channel();

        let fs = Arc::clone(&self.fs);
        let gate = Arc::clone(&self.gate);
        let command_line = command_line.to_owned();

        self.pool.execute(move || {
            let status = match mode {
                DispatchMode::Shared => {
                    let _guard = gate.read().unwrap();
                    run_command(&fs, &command_line)
                }
                DispatchMode::Exclusive => {
                    let _guard = gate.write().unwrap();
                    run_command(&fs, &command_line)
                }
            };
            let _ = sender.send(status);
        })?;

        Ok(receiver)
    }

    /// 在调用方线程同步执行一条命令行。
    pub fn execute_sync(&self, command_line: &str) -> i32 {
        match resolve_mode(command_line) {
            DispatchMode::Shared => {
                let _guard = self.gate.read().unwrap();
                run_command(&self.fs, command_line)
            }
            DispatchMode::Exclusive => {
                let _guard = self.gate.write().unwrap();
                run_command(&self.fs, command_line)
            }
        }
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.pool.thread_count()
    }
}

/// 按命令名分类，而不是按实际行为。
fn resolve_mode(command_line: &str) -> DispatchMode {
    match command_line.split_whitespace().next() {
        Some("ls" | "cat" | "info") => DispatchMode::Shared,
        _ => DispatchMode::Exclusive,
    }
}

/// 执行一条引擎层命令，返回 0/1 退出状态。
fn run_command(fs: &MindFileSystem, command_line: &str) -> i32 {
    let mut tokens = command_line.split_whitespace();
    let Some(name) = tokens.next() else {
        return 1;
    };
    let args: Vec<&str> = tokens.collect();

    let outcome = match name {
        "info" => print_info(fs),
        "format" => fs.format(),
        "ls" => list(fs, args.first().copied().unwrap_or("/")),
        "mkdir" => single_arg(&args).and_then(|p| fs.create_directory(p)),
        "touch" => single_arg(&args).and_then(|p| touch(fs, p)),
        "rm" => single_arg(&args).and_then(|p| remove(fs, p)),
        "cat" => single_arg(&args).and_then(|p| cat(fs, p)),
        "echo" => echo(fs, &args),
        "copy" | "cp" => copy(fs, &args),
        _ => {
            error!("unknown command: {name}");
            Err(FsError::UnknownCommand)
        }
    };

    match outcome {
        Ok(()) => 0,
        Err(err) => {
            error!("{name}: {err}");
            1
        }
    }
}

fn single_arg<'a>(args: &[&'a str]) -> Result<&'a str, FsError> {
    match args {
        [path] => Ok(*path),
        _ => Err(FsError::InvalidSyntax),
    }
}

fn print_info(fs: &MindFileSystem) -> Result<(), FsError> {
    print!("{}", fs.get_disk_info()?);
    Ok(())
}

fn list(fs: &MindFileSystem, dir_path: &str) -> Result<(), FsError> {
    for entry in fs.list_directory(dir_path)? {
        println!("{}", entry.name());
    }
    Ok(())
}

fn touch(fs: &MindFileSystem, file_path: &str) -> Result<(), FsError> {
    if fs.file_exists(file_path) {
        return Ok(());
    }
    fs.create_file(file_path, ModeFlag::file_default()).map(|_| ())
}

fn remove(fs: &MindFileSystem, file_path: &str) -> Result<(), FsError> {
    if fs.is_directory(file_path) {
        fs.remove_directory(file_path)
    } else {
        fs.delete_file(file_path)
    }
}

fn cat(fs: &MindFileSystem, file_path: &str) -> Result<(), FsError> {
    let content = read_all(fs, file_path)?;
    println!("{}", String::from_utf8_lossy(&content));
    Ok(())
}

/// `echo <text...> > <path>`：把文本写入文件，文件内容不含换行。
fn echo(fs: &MindFileSystem, args: &[&str]) -> Result<(), FsError> {
    let Some(redirect) = args.iter().position(|arg| *arg == ">") else {
        return Err(FsError::InvalidSyntax);
    };
    let [file_path] = &args[redirect + 1..] else {
        return Err(FsError::InvalidSyntax);
    };
    let text = args[..redirect].join(" ");

    let fd = fs.open_file(file_path, OpenMode::Write | OpenMode::Create)?;
    let result = fs.write_file(fd, text.as_bytes()).map(|_| ());
    let closed = fs.close_file(fd);
    result.and(closed)
}

fn copy(fs: &MindFileSystem, args: &[&str]) -> Result<(), FsError> {
    let [source, target] = args else {
        return Err(FsError::InvalidSyntax);
    };

    let content = read_all(fs, source)?;
    let fd = fs.open_file(target, OpenMode::Write | OpenMode::Create)?;
    let result = fs.write_file(fd, &content).map(|_| ());
    let closed = fs.close_file(fd);
    result.and(closed)
}

fn read_all(fs: &MindFileSystem, file_path: &str) -> Result<Vec<u8>, FsError> {
    let fd = fs.open_file(file_path, OpenMode::Read.into())?;

    let mut content = Vec::new();
    let mut chunk = [0u8; crate::BLOCK_SIZE];
    let result = loop {
        match fs.read_file(fd, &mut chunk) {
            Ok(0) => break Ok(()),
            Ok(count) => content.extend_from_slice(&chunk[..count]),
            Err(err) => break Err(err),
        }
    };

    let closed = fs.close_file(fd);
    result.and(closed)?;
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_commands_are_shared() {
        assert_eq!(resolve_mode("ls /"), DispatchMode::Shared);
        assert_eq!(resolve_mode("  cat /a.txt"), DispatchMode::Shared);
        assert_eq!(resolve_mode("info"), DispatchMode::Shared);
    }

    #[test]
    fn everything_else_is_exclusive() {
        assert_eq!(resolve_mode("touch /a"), DispatchMode::Exclusive);
        assert_eq!(resolve_mode("mkdir /d"), DispatchMode::Exclusive);
        assert_eq!(resolve_mode(""), DispatchMode::Exclusive);
        assert_eq!(resolve_mode("lsx"), DispatchMode::Exclusive);
    }

    #[test]
    fn pool_runs_submitted_jobs() {
        use std::sync::atomic::AtomicUsize;

        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        let (sender, receiver) = mpsc::channel();
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            let sender = sender.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = sender.send(());
            })
            .unwrap();
        }
        for _ in 0..32 {
            receiver.recv().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn drop_joins_workers_and_rejects_new_jobs() {
        let pool = ThreadPool::new(2);
        assert_eq!(pool.thread_count(), 2);

        pool.shared.stop.store(true, Ordering::Release);
        assert_eq!(pool.execute(|| {}), Err(FsError::InvalidArgument));
    }
}
