use clap::Parser;
#[derive(Parser)]
#[command(author, version, about, long_about)]
pub struct Cli {
    /// The request url,like http://www.google.com
    pub url: String,
    ///  Specify request method to use
    #[arg(short = 'X', long = "request", value_name = "method")]
    pub method_option: Option<String>,
    /// HTTP POST data.
    #[arg(short = 'd', long = "data", value_name = "data")]
    pub body_option: Option<String>,
    /// The http headers.
    #[arg(short = 'H', long = "header", value_name = "header")]
    pub headers: Vec<String>,
    /// The pem path.
    #[arg(short = 'c', long)]
    pub certificate_path_option: Option<String>,
    ///  Send User-Agent <name> to server
    #[arg(short = 'A', long = "user-agent", value_name = "name")]
    pub user_agent_option: Option<String>,
    ///  Write to file instead of stdout.
    #[arg(short = 'o', long = "output", value_name = "file")]
    pub file_path_option: Option<String>,
    /// The namespace prefixed to every exported metric name.
    #[arg(short = 'n', long = "namespace", value_name = "name", default_value = "rpulse")]
    pub namespace: String,
    /// Issue the request <count> times over one client, reusing the
    /// connection where the server allows it.
    #[arg(long = "repeat", value_name = "count", default_value_t = 1)]
    pub repeat: u32,
    /// Print the per-phase time breakdown after each transfer.
    #[arg(short = 't', long = "time")]
    pub time: bool,
    /// Dump the collected metrics in Prometheus text format at exit.
    #[arg(short = 'm', long = "metrics")]
    pub metrics: bool,
    ///  Make the operation more talkative
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}
