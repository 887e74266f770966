//! `podlink parse <ADDR>`: show how an address is interpreted.

use anyhow::Result;
use podlink_core::{split_host_port, RemoteTarget};

pub fn run(addr: &str) -> Result<()> {
    let target = RemoteTarget::parse(addr)?;
    println!("name:  {}", target.name);
    println!("scope: {}", target.scope);
    match split_host_port(addr) {
        Ok((_, port)) => println!("port:  {port}"),
        Err(_) => println!("port:  (none, required for forwarding)"),
    }
    Ok(())
}
