use clap::Parser;

fn main() {
    let args = fab_tcp::GetArgs::parse();
    std::process::exit(fab_tcp::run_get(args));
}
