use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bucketfs::config::{MountConfig, RmdirPolicy};
use bucketfs::fs::ObjectFs;
use bucketfs::fuse::FuseAdapter;
use bucketfs::storage::{LocalStorage, MemoryStorage, ObjectStore};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Mount an object store as a filesystem", long_about = None)]
struct Args {
    /// 挂载点路径
    #[arg(short, long)]
    mount: PathBuf,

    /// 本地对象存储目录
    #[arg(short, long, conflicts_with = "memory")]
    store: Option<PathBuf>,

    /// 使用进程内存储（卸载后数据丢失）
    #[arg(long)]
    memory: bool,

    /// JSON 配置文件
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// rmdir 非空目录时递归删除
    #[arg(long)]
    recursive_rmdir: bool,

    /// 允许其他用户访问挂载点
    #[arg(long)]
    allow_other: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_ansi(false)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => MountConfig::from_file(path)?,
        None => MountConfig::new(),
    };
    if args.recursive_rmdir {
        config.rmdir_policy = RmdirPolicy::Recursive;
    }
    if args.allow_other {
        config.allow_other = true;
    }

    let store: Arc<dyn ObjectStore> = match (&args.store, args.memory) {
        (Some(dir), _) => Arc::new(
            LocalStorage::open(dir.clone())
                .await
                .with_context(|| format!("opening object store {:?}", dir))?,
        ),
        (None, true) => Arc::new(MemoryStorage::new()),
        (None, false) => bail!("either --store <dir> or --memory is required"),
    };
    info!(
        "initialising filesystem, mount={:?}, store={:?}, rmdir_policy={:?}",
        args.mount, store, config.rmdir_policy
    );

    if !args.mount.exists() {
        info!("creating mount point {:?}", args.mount);
        std::fs::create_dir_all(&args.mount)
            .with_context(|| format!("creating mount point {:?}", args.mount))?;
    }

    let fs = Arc::new(ObjectFs::new(store, config));
    let adapter = FuseAdapter::new(fs, tokio::runtime::Handle::current());
    let session = adapter
        .spawn_mount(&args.mount, "bucketfs")
        .with_context(|| format!("mounting at {:?}", args.mount))?;

    info!("mounted, waiting for Ctrl+C");
    signal::ctrl_c().await.context("listening for Ctrl+C")?;
    info!("interrupt received, unmounting {:?}", args.mount);

    // join 会卸载并等待会话线程结束；运行时的其他工作线程继续驱动未完成的请求
    session.join();
    info!("unmounted");
    Ok(())
}
