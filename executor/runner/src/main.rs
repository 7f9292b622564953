use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use vatrun_id_types::{MemoryId, RefId, UrbjectId};
use vatrun_kv_store::backend::lmdb::Lmdb;
use vatrun_runtime::{Vat, MAX_SUB_DBS};

#[derive(Parser, Debug)]
#[command(name = "vatrun", version, about = "Administer a vatrun node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Base {
    /// Base directory of the node
    #[arg(short = 'd', long = "base")]
    base: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new node (storage plus vat identity)
    CreateNode(Base),
    /// Object administration
    #[command(subcommand)]
    Admin(Admin),
    /// Send a message to a spid (vatid:urbjid) on the local node
    Send {
        #[command(flatten)]
        base: Base,
        /// Target spid, the colon-joined vatid:urbjid
        spid: String,
        /// Message arguments as JSON
        #[arg(default_value = "{}")]
        args: String,
    },
    /// Drain the inbound message queue
    Poke(Base),
}

#[derive(Subcommand, Debug)]
enum Admin {
    /// Make a memory slot
    CreateMemory {
        #[command(flatten)]
        base: Base,
        /// File (JSON) with initial memory contents
        #[arg(short = 'm', long = "memory-file")]
        memory_file: Option<PathBuf>,
    },
    /// List all memory slots
    ListMemory(Base),
    /// Display a memory slot
    DumpMemory {
        #[command(flatten)]
        base: Base,
        memid: String,
    },
    /// Make an urbject from a code file
    CreateUrbject {
        #[command(flatten)]
        base: Base,
        /// Guest source file
        codefile: PathBuf,
        /// Existing memid to give to the urbject
        #[arg(long, conflicts_with = "no_memory")]
        memid: Option<String>,
        /// Deny persistent storage
        #[arg(long)]
        no_memory: bool,
        /// File (JSON) with initial memory contents
        #[arg(
            short = 'm',
            long = "memory-file",
            conflicts_with_all = ["memid", "no_memory"]
        )]
        memory_file: Option<PathBuf>,
    },
    /// List all urbjects
    ListUrbjects(Base),
    /// Display an urbject
    DumpUrbject {
        #[command(flatten)]
        base: Base,
        urbjid: String,
    },
}

fn open_vat(base: &Base) -> Result<Vat<Lmdb>> {
    if !base.base.is_dir() {
        bail!(
            "'{}' doesn't look like a vatrun basedir, quitting",
            base.base.display()
        );
    }
    let db = Lmdb::new(&base.base, MAX_SUB_DBS)
        .with_context(|| format!("failed to open storage in '{}'", base.base.display()))?;
    Ok(Vat::open(db)?)
}

fn create_node(base: &Base) -> Result<()> {
    fs::create_dir_all(&base.base)
        .with_context(|| format!("failed to create '{}'", base.base.display()))?;
    let db = Lmdb::new(&base.base, MAX_SUB_DBS)?;
    if Vat::open(db.clone()).is_ok() {
        bail!("'{}' already contains a node", base.base.display());
    }
    let vat = Vat::create(db)?;
    println!("node created in {}", base.base.display());
    println!("{}", vat.id());
    Ok(())
}

fn create_memory(base: &Base, memory_file: Option<&PathBuf>) -> Result<()> {
    let vat = open_vat(base)?;
    let initial = match memory_file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read '{}'", path.display()))?,
        None => "{}".to_string(),
    };
    let memid = vat.create_memory(&initial)?;
    println!("{memid}");
    Ok(())
}

fn create_urbject(
    base: &Base,
    codefile: &PathBuf,
    memid: Option<&str>,
    no_memory: bool,
    memory_file: Option<&PathBuf>,
) -> Result<()> {
    let vat = open_vat(base)?;
    let code = fs::read_to_string(codefile)
        .with_context(|| format!("failed to read '{}'", codefile.display()))?;
    let memid = if no_memory {
        None
    } else if let Some(memid) = memid {
        Some(MemoryId::parse_str(memid)?)
    } else {
        let initial = match memory_file {
            Some(path) => fs::read_to_string(path)
                .with_context(|| format!("failed to read '{}'", path.display()))?,
            None => "{}".to_string(),
        };
        Some(vat.create_memory(&initial)?)
    };
    let refid = vat.create_urbject(&code, memid.as_ref())?;
    println!("{}", refid.to_spid());
    Ok(())
}

fn send(base: &Base, spid: &str, args: &str) -> Result<()> {
    // make sure it's really JSON before it goes anywhere
    serde_json::from_str::<serde_json::Value>(args).context("args must be valid JSON")?;
    let vat = open_vat(base)?;
    let target = RefId::parse_spid(spid)?;
    vat.send_invoke(&target, args)?;
    let drained = vat.drain_inbound()?;
    println!("message sent, {drained} message(s) processed");
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::CreateNode(base) => create_node(base),
        Command::Admin(Admin::CreateMemory { base, memory_file }) => {
            create_memory(base, memory_file.as_ref())
        }
        Command::Admin(Admin::ListMemory(base)) => {
            let vat = open_vat(base)?;
            for memid in vat.list_memories()? {
                println!("{memid}");
            }
            Ok(())
        }
        Command::Admin(Admin::DumpMemory { base, memid }) => {
            let vat = open_vat(base)?;
            let memid = MemoryId::parse_str(memid)?;
            println!("{}", vat.dump_memory(&memid)?);
            Ok(())
        }
        Command::Admin(Admin::CreateUrbject {
            base,
            codefile,
            memid,
            no_memory,
            memory_file,
        }) => create_urbject(
            base,
            codefile,
            memid.as_deref(),
            *no_memory,
            memory_file.as_ref(),
        ),
        Command::Admin(Admin::ListUrbjects(base)) => {
            let vat = open_vat(base)?;
            for urbjid in vat.list_urbjects()? {
                println!("{urbjid}");
            }
            Ok(())
        }
        Command::Admin(Admin::DumpUrbject { base, urbjid }) => {
            let vat = open_vat(base)?;
            let urbjid = UrbjectId::parse_str(urbjid)?;
            let dump = vat.dump_urbject(&urbjid)?;
            println!("urbjid: {}", dump.urbjid);
            println!("powid:  {}", dump.powid);
            println!("power:  {}", dump.power_json);
            println!("code:");
            println!("{}", dump.code);
            Ok(())
        }
        Command::Send { base, spid, args } => send(base, spid, args),
        Command::Poke(base) => {
            let vat = open_vat(base)?;
            let drained = vat.drain_inbound()?;
            info!("poked vat {}", vat.id());
            println!("{drained} message(s) processed");
            Ok(())
        }
    }
}

fn main() {
    colog::init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
