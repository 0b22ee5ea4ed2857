use clap::Parser;
use sparc_vm::emulator::{Machine, RunExit};
use sparc_vm::mmu::{EvictionPolicy, MmuConfig, PageSize};
use sparc_vm::snapshot::MachineSnapshot;
use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// ELF executable or raw image to run (raw images load at the RAM base)
    #[arg(short, long, required_unless_present = "load_snapshot")]
    image: Option<PathBuf>,

    /// RAM size in MiB
    #[arg(long, default_value_t = 16)]
    mem_mib: usize,

    /// Page size in KiB (4, 8, 16 or 32)
    #[arg(long, default_value_t = 4)]
    page_kib: u32,

    /// TLB capacity in entries (per TLB when split)
    #[arg(long, default_value_t = 64)]
    tlb_entries: usize,

    /// Use a single shared TLB instead of split instruction/data TLBs
    #[arg(long)]
    shared_tlb: bool,

    /// TLB replacement policy: lru or random
    #[arg(long, default_value = "lru")]
    tlb_policy: EvictionPolicy,

    /// Stop after this many steps
    #[arg(long)]
    max_steps: Option<u64>,

    /// Override the entry point (accepts 0x-prefixed hex)
    #[arg(long, value_parser = parse_u32)]
    entry: Option<u32>,

    /// Restore machine state from this snapshot before running
    #[arg(long)]
    load_snapshot: Option<PathBuf>,

    /// Save machine state to this snapshot when the run ends
    #[arg(long)]
    save_snapshot: Option<PathBuf>,
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let t = s.trim();
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| e.to_string())
    } else {
        t.parse::<u32>().map_err(|e| e.to_string())
    }
}

fn print_banner() {
    const BANNER: &str = r#"
    ┌──────────────────────────────────────────────────────────┐
    │                                                          │
    │   ███████╗██████╗  █████╗ ██████╗  ██████╗               │
    │   ██╔════╝██╔══██╗██╔══██╗██╔══██╗██╔════╝               │
    │   ███████╗██████╔╝███████║██████╔╝██║                    │
    │   ╚════██║██╔═══╝ ██╔══██║██╔══██╗██║                    │
    │   ███████║██║     ██║  ██║██║  ██║╚██████╗               │
    │   ╚══════╝╚═╝     ╚═╝  ╚═╝╚═╝  ╚═╝ ╚═════╝               │
    │                                                          │
    │   SPARC V8 System Simulator v0.1.0                       │
    │   32-bit big-endian, windowed registers, SRMMU           │
    │                                                          │
    └──────────────────────────────────────────────────────────┘
"#;
    println!("{}", BANNER);
}

fn print_section(title: &str) {
    println!("\n\x1b[1;36m━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\x1b[0m");
    println!("\x1b[1;33m  ▸ {}\x1b[0m", title);
    println!("\x1b[1;36m━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\x1b[0m");
}

fn print_info(key: &str, value: &str) {
    println!("    \x1b[0;90m├─\x1b[0m \x1b[0;37m{:<20}\x1b[0m \x1b[1;97m{}\x1b[0m", key, value);
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<ExitCode, Box<dyn std::error::Error>> {
    print_banner();

    let page_size =
        PageSize::from_kib(args.page_kib).ok_or("page size must be 4, 8, 16 or 32 KiB")?;
    let config = MmuConfig {
        page_size,
        tlb_entries: args.tlb_entries,
        split_tlb: !args.shared_tlb,
        policy: args.tlb_policy,
    };
    let dram_size_bytes = args
        .mem_mib
        .checked_mul(1024 * 1024)
        .ok_or("requested memory size is too large")?;

    print_section("MACHINE CONFIGURATION");
    print_info("RAM", &format!("{} MiB", args.mem_mib));
    print_info("Page Size", &format!("{} KiB", args.page_kib));
    print_info(
        "TLB",
        &format!(
            "{} entries, {}, {:?}",
            args.tlb_entries,
            if args.shared_tlb { "shared" } else { "split I/D" },
            args.tlb_policy
        ),
    );

    let mut machine = Machine::with_config(dram_size_bytes, config);

    if let Some(path) = &args.load_snapshot {
        let mut file = File::open(path)?;
        let snapshot: MachineSnapshot = bincode::deserialize_from(&mut file)?;
        machine.apply_snapshot(&snapshot)?;
        print_info("Snapshot", &path.display().to_string());
    }

    if let Some(path) = &args.image {
        let entry = machine.load_elf(path)?;
        print_section("IMAGE");
        print_info("Path", &path.display().to_string());
        print_info("Entry Point", &format!("0x{entry:08X}"));
    }

    if let Some(entry) = args.entry {
        machine.set_entry(entry);
        print_info("Entry Override", &format!("0x{entry:08X}"));
    }

    print_section("EXECUTION");
    let exit = machine.run(args.max_steps);

    if let Some(path) = &args.save_snapshot {
        machine.save_snapshot_to_path(path)?;
        print_info("Snapshot Saved", &path.display().to_string());
    }

    print_section("STATISTICS");
    print!("{}", machine.stats_report());

    match exit {
        RunExit::PowerDown(code) => {
            println!("\nguest powered down (code {code:#x})");
            Ok(ExitCode::from((code & 0xFF) as u8))
        }
        RunExit::ErrorMode(tt) => {
            eprintln!(
                "\nprocessor entered error mode: tt={tt:#04x} pc=0x{:08x} psr=0x{:08x}",
                machine.cpu.regs.pc,
                machine.cpu.regs.psr()
            );
            Ok(ExitCode::FAILURE)
        }
        RunExit::StepLimit(steps) => {
            println!("\nstep limit reached after {steps} steps at pc=0x{:08x}", machine.cpu.regs.pc);
            Ok(ExitCode::SUCCESS)
        }
        RunExit::Halted(steps) => {
            println!("\nhalt requested after {steps} steps at pc=0x{:08x}", machine.cpu.regs.pc);
            Ok(ExitCode::SUCCESS)
        }
        RunExit::Fatal(msg) => {
            eprintln!("\nfatal simulator error: {msg}");
            eprintln!("PC: 0x{:08x}", machine.cpu.regs.pc);
            for i in 0..32 {
                if i % 4 == 0 {
                    eprintln!();
                }
                eprint!("r{:<2}: 0x{:08x}  ", i, machine.cpu.regs.read(i));
            }
            eprintln!();
            Ok(ExitCode::FAILURE)
        }
    }
}
