use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "boxvm", about = "Container-hosted VM supervisor for KVM/QEMU via libvirt")]
pub struct Cli {
    /// Do not attach to the guest serial console
    #[arg(long)]
    pub no_console: bool,

    /// List available distributions and exit (optionally filter by arch)
    #[arg(long, value_name = "ARCH", num_args = 0..=1, default_missing_value = "")]
    pub list_distros: Option<String>,

    /// Show the resolved VM configuration and exit
    #[arg(long)]
    pub show_config: bool,

    /// Render the libvirt domain XML and exit
    #[arg(long)]
    pub show_xml: bool,

    /// Validate configuration and environment, then exit
    #[arg(long)]
    pub dry_run: bool,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}
