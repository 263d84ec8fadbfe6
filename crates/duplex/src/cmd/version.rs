use duplex_transport::{DEFAULT_MAX_MESSAGE, MAGIC};

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("duplex {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: duplex");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("DUPLEX_BUILD_TARGET").unwrap_or("unknown")
    );
    println!(
        "profile: {}",
        option_env!("DUPLEX_BUILD_PROFILE").unwrap_or("unknown")
    );
    println!(
        "features: peer={}, cli=true",
        cfg!(feature = "peer")
    );
    println!(
        "envelope: magic={:?}, max_message={}",
        String::from_utf8_lossy(&MAGIC),
        DEFAULT_MAX_MESSAGE
    );

    Ok(SUCCESS)
}
