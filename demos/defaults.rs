use flagship::{Client, Config, Context};
use std::{env, process};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() != 2 {
        eprintln!("Please pass an SDK key as the first argument");
        process::exit(1);
    }

    let config = Config::builder(args[1].clone()).build();
    let client = Client::build(config).expect("invalid configuration");
    if client.wait_for_initialization().await.is_none() {
        eprintln!("still initializing, evaluations will use defaults");
    }

    let context = Context::builder("example-user")
        .name("Example User")
        .build()
        .expect("valid context");
    dbg!(client.all_flags_state(&context));

    client.close().await;
}
