// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use clap::Parser;

#[derive(Debug, clap::Parser)]
#[command(long_about = None)]
struct Args {
    #[arg(short, long, default_value_t = String::from("slurmd_deploy.toml"))]
    config_file: String,
    #[arg(short, long, default_value_t = String::from(""))]
    template: String,
    /// Remove the artifacts and marker files of the configuration and quit.
    #[arg(long, default_value_t = false)]
    clean: bool,
    /// Print the version number and quit.
    #[arg(long, default_value_t = false)]
    version: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    if args.version {
        println!(
            "{}.{}.{}{}{}",
            env!("CARGO_PKG_VERSION_MAJOR"),
            env!("CARGO_PKG_VERSION_MINOR"),
            env!("CARGO_PKG_VERSION_PATCH"),
            if env!("CARGO_PKG_VERSION_PRE").is_empty() { "" } else { "-" },
            env!("CARGO_PKG_VERSION_PRE")
        );
        return Ok(());
    }
    if !args.template.is_empty() {
        slurmd_deploy_api::util::create_template(&args.template, slurmd_deploy_orc::slurmd_deploy_default_conf().as_str())?;
        return Ok(());
    }
    let conf: slurmd_deploy_orc::SlurmdDeploySettings = toml::from_str(&std::fs::read_to_string(args.config_file)?)?;

    if args.clean {
        slurmd_deploy_orc::artifacts::cleanup_artifacts(&conf.local_files());
        return Ok(());
    }

    let async_runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let report = async_runtime.block_on(slurmd_deploy_orc::slurmd_deploy_main(conf))?;
    println!("{}", report);
    Ok(())
}
