use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "chorus-server", about = "Chorus real-time chat coordination server")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/chorus.toml")]
    pub config: String,

    /// Address to listen on (overrides config)
    #[arg(long)]
    pub bind: Option<String>,
}
