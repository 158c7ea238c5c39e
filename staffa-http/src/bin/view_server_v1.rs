use std::env;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use rand::Rng;

use staffa::input::hestia::Hestia;
use staffa_http::bus::LocalBus;
use staffa_http::http::view_v1::{
    server::{
        latest_result, list_views, meta, resolve_name, start_live, status, stop_live, topics,
    },
    AppState,
};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();
    let args: Vec<String> = env::args().collect();

    let address: String = args[1].clone();
    let port: u16 = args[2].parse().unwrap();

    let source = Arc::new(Hestia::random(vec!["ABC", "BCD"]));

    // Stand-in for a live market feed.
    let ticker = source.clone();
    thread::spawn(move || loop {
        {
            let mut rng = rand::thread_rng();
            ticker.set("ABC", rng.gen_range(90.0..100.0));
            ticker.set("BCD", rng.gen_range(90.0..100.0));
        }
        thread::sleep(Duration::from_secs(1));
    });

    let state = web::Data::new(AppState::with_source(source, LocalBus::new()));

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .service(list_views)
            .service(resolve_name)
            .service(status)
            .service(latest_result)
            .service(meta)
            .service(topics)
            .service(start_live)
            .service(stop_live)
    })
    .bind((address, port))?
    .run()
    .await
}
