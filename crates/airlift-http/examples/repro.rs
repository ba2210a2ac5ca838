use axum::routing::get;
#[tokio::main]
async fn main() {
    let app = axum::Router::new().route("/artifact", get(|| async { "hi" }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap(); });
    let url = format!("http://{addr}/artifact");
    let client = reqwest::Client::new();
    match client.get(&url).send().await {
        Ok(r) => println!("OK {:?}", r.status()),
        Err(e) => println!("ERR {:?}", e),
    }
}
