use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use log::{debug, error};

use beacon_server::codec::{Command, MeasurementType, ReferenceRequest, Signal};
use beacon_server::config::DEFAULT_RELAY_BOUND;
use beacon_server::dispatch::{DispatchReply, DispatcherClient};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Query {
    Temperature,
    Pressure,
    Status,
}

#[derive(Parser)]
#[command(name = "reference_query")]
#[command(about = "Query a reference station through the dispatcher", long_about = None)]
struct Args {
    /// Routing id of the station
    station: u8,

    #[arg(value_enum, default_value_t = Query::Temperature)]
    query: Query,

    /// Dispatcher address
    #[arg(long, default_value = "127.0.0.1:32769")]
    dispatcher: String,

    /// Seconds to wait for the relayed response. The default outlasts a
    /// station that exhausts every attempt under default link settings.
    #[arg(long, default_value_t = DEFAULT_RELAY_BOUND.as_secs() + 10)]
    timeout: u64,
}

fn request(station: u8, query: Query) -> ReferenceRequest {
    match query {
        Query::Temperature => ReferenceRequest::measure(station, MeasurementType::Temperature),
        Query::Pressure => ReferenceRequest::measure(station, MeasurementType::Pressure),
        Query::Status => ReferenceRequest {
            routing_id: station,
            signal: Signal::Enq,
            command: Command::Status,
            param: 0,
        },
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut client = match DispatcherClient::connect(
        args.dispatcher.as_str(),
        Duration::from_secs(args.timeout),
    ) {
        Ok(client) => client,
        Err(e) => {
            error!("cannot reach dispatcher at {}: {}", args.dispatcher, e);
            return ExitCode::FAILURE;
        }
    };
    let req = request(args.station, args.query);
    debug!("sending {:?}", req);
    let reply = client.request(&req);
    client.close();

    match reply {
        Ok(DispatchReply::Rejected) => {
            error!("no station registered under id {}", args.station);
            ExitCode::FAILURE
        }
        Ok(DispatchReply::Response(resp)) if resp.signal == Signal::Nak => {
            error!("station {} is unavailable", args.station);
            ExitCode::FAILURE
        }
        Ok(DispatchReply::Response(resp)) => match resp.value() {
            Ok(value) => {
                println!("{}", value);
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("unreadable response: {}", e);
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            error!("query failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
