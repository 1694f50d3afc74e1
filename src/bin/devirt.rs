//! CLI entry point: traces a target binary's VM dispatch loop and
//! re-emits it as either native machine code or LLVM IR.

use std::path::PathBuf;

use argh::FromArgs;
use devirt::config::TargetConfig;
use devirt::driver;
use devirt::decode::MemoryReader;
use devirt::emit::native::NativeEmitter;
use devirt::emit::Artifact;
use devirt::error::Result;
use tracing_subscriber::EnvFilter;

#[derive(FromArgs)]
/// devirtualize a VM-protected x86-64 binary
struct Args {
    /// path to the target image
    #[argh(positional)]
    image: PathBuf,

    /// emit LLVM IR to bytecode.ll instead of native code
    #[argh(switch, long = "llvm")]
    llvm: bool,

    /// emit native code and overlay it into a patched output.exe
    #[argh(switch, long = "asmjit")]
    asmjit: bool,

    /// override the bytecode stream's base address
    #[argh(option, long = "bytecode-base")]
    bytecode_base: Option<u64>,

    /// override the initial rolling key
    #[argh(option, long = "initial-key")]
    initial_key: Option<u64>,

    /// override the initial ROR key used to decrypt the first handler
    #[argh(option, long = "initial-ror-key")]
    initial_ror_key: Option<u64>,

    /// override the VM entrypoint's file offset
    #[argh(option, long = "vm-entry-offset")]
    vm_entry_offset: Option<u64>,
}

impl Args {
    fn config(&self) -> TargetConfig {
        let defaults = TargetConfig::default();
        TargetConfig {
            bytecode_base: self.bytecode_base.unwrap_or(defaults.bytecode_base),
            initial_key: self.initial_key.unwrap_or(defaults.initial_key),
            initial_ror_key: self.initial_ror_key.unwrap_or(defaults.initial_ror_key),
            vm_entry_offset: self.vm_entry_offset.unwrap_or(defaults.vm_entry_offset),
        }
    }
}

#[cfg(windows)]
fn load_image(path: &std::path::Path) -> Result<Box<dyn MemoryReader>> {
    Ok(Box::new(devirt::image::ProcessImage::load(path)?))
}

#[cfg(not(windows))]
fn load_image(path: &std::path::Path) -> Result<Box<dyn MemoryReader>> {
    Ok(Box::new(devirt::image::FileImage::load(path)?))
}

fn run_native(reader: &dyn devirt::decode::MemoryReader, config: &TargetConfig, args: &Args) -> Result<()> {
    let mut emitter = NativeEmitter::new();
    driver::run(reader, config, &mut emitter)?;
    let Artifact::Native(code) = emitter.compile()? else {
        unreachable!("NativeEmitter::compile always returns Artifact::Native");
    };

    tracing::info!(bytes = code.len(), "native code emitted");

    let mut image_bytes = std::fs::read(&args.image)?;
    let offset = config.vm_entry_offset as usize;
    let end = offset + code.len();
    if end > image_bytes.len() {
        image_bytes.resize(end, 0);
    }
    image_bytes[offset..end].copy_from_slice(&code);
    std::fs::write("output.exe", image_bytes)?;
    tracing::info!("wrote output.exe");

    Ok(())
}

#[cfg(feature = "ir-backend")]
fn run_ir(reader: &dyn devirt::decode::MemoryReader, config: &TargetConfig) -> Result<()> {
    use devirt::emit::ir::IrEmitter;
    use inkwell::context::Context;

    let context = Context::create();
    let mut emitter = IrEmitter::new(&context, "devirt");
    driver::run(reader, config, &mut emitter)?;
    let Artifact::Ir(ir) = emitter.compile()? else {
        unreachable!("IrEmitter::compile always returns Artifact::Ir");
    };

    std::fs::write("bytecode.ll", ir)?;
    tracing::info!("wrote bytecode.ll");

    Ok(())
}

#[cfg(not(feature = "ir-backend"))]
fn run_ir(_reader: &dyn devirt::decode::MemoryReader, _config: &TargetConfig) -> Result<()> {
    tracing::error!("this build was compiled without the `ir-backend` feature");
    std::process::exit(1);
}

fn main() {
    let args: Args = argh::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("DEVIRT_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = args.config();

    let result = (|| -> Result<()> {
        let image = load_image(&args.image)?;
        let reader = image.as_ref();

        if args.llvm {
            run_ir(reader, &config)
        } else {
            // `-asmjit` and the no-flag default both take the native path;
            // the native path is the only one that produces a patchable
            // output.
            let _ = args.asmjit;
            run_native(reader, &config, &args)
        }
    })();

    if let Err(err) = result {
        tracing::error!(error = %err, "devirtualization failed");
        std::process::exit(1);
    }
}
