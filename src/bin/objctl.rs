use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bucketfs::config::{MountConfig, RmdirPolicy};
use bucketfs::fs::ObjectFs;
use bucketfs::storage::LocalStorage;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "对象存储文件系统命令行工具", long_about = None)]
struct Args {
    /// 本地对象存储目录
    #[arg(short, long)]
    store: PathBuf,

    /// rmdir 非空目录时递归删除
    #[arg(long)]
    recursive_rmdir: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 显示路径属性
    Stat { path: String },
    Mkdir { path: String },
    Rmdir { path: String },
    /// 创建空文件
    Create { path: String },
    /// 检查目录是否存在
    Opendir { path: String },
    Readdir { path: String },
    Write {
        path: String,
        data: String,
        #[arg(long, default_value = "0")]
        offset: u64,
    },
    Read {
        path: String,
        #[arg(long, default_value = "1024")]
        size: usize,
        #[arg(long, default_value = "0")]
        offset: u64,
    },
    Rename { path: String, new_path: String },
    Unlink { path: String },
    Truncate { path: String, length: u64 },
    Listxattr { path: String },
    Getxattr { path: String, name: String },
    Setxattr { path: String, name: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let store = LocalStorage::open(args.store.clone())
        .await
        .with_context(|| format!("opening object store {:?}", args.store))?;
    let mut config = MountConfig::new();
    if args.recursive_rmdir {
        config.rmdir_policy = RmdirPolicy::Recursive;
    }
    let fs = ObjectFs::new(Arc::new(store), config);

    match args.command {
        Command::Stat { path } => {
            let attr = fs.getattr(&path).await?;
            println!(
                "{}\t{:?}\tmode={:o}\tsize={}\tnlink={}",
                path,
                attr.kind,
                attr.mode(),
                attr.size,
                attr.nlink
            );
        }
        Command::Mkdir { path } => fs.mkdir(&path).await?,
        Command::Rmdir { path } => fs.rmdir(&path).await?,
        Command::Create { path } => {
            let (fh, _) = fs.create(&path, 0o644).await?;
            fs.release(fh);
        }
        Command::Opendir { path } => {
            fs.opendir(&path).await?;
        }
        Command::Readdir { path } => {
            for entry in fs.readdir(&path).await?.entries {
                println!("{}", entry.name);
            }
        }
        Command::Write { path, data, offset } => {
            let fh = fs.open(&path, libc::O_WRONLY);
            let result = fs.write(&path, data.as_bytes(), offset).await;
            fs.release(fh);
            let written = result?;
            info!("wrote {} bytes to {}", written, path);
        }
        Command::Read { path, size, offset } => {
            let fh = fs.open(&path, libc::O_RDONLY);
            let result = fs.read(&path, size, offset).await;
            fs.release(fh);
            println!("{}", String::from_utf8_lossy(&result?));
        }
        Command::Rename { path, new_path } => fs.rename(&path, &new_path).await?,
        Command::Unlink { path } => fs.unlink(&path).await?,
        Command::Truncate { path, length } => {
            fs.truncate(&path, length).await?;
        }
        Command::Listxattr { path } => {
            for name in fs.listxattr(&path).await? {
                println!("{}", name);
            }
        }
        Command::Getxattr { path, name } => println!("{}", fs.getxattr(&path, &name).await?),
        Command::Setxattr { path, name, value } => fs.setxattr(&path, &name, &value).await?,
    }

    Ok(())
}
