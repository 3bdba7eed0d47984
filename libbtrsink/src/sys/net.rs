use http::Request;
use hyper::{client::connect::dns::GaiResolver, client::HttpConnector, Body, Client, Response, Uri};
use hyper_timeout::TimeoutConnector;
use hyper_tls::HttpsConnector;
use std::time::Duration;

type HyperClient = Client<TimeoutConnector<HttpsConnector<HttpConnector<GaiResolver>>>>;

pub struct HttpsClient {
    client: HyperClient,
}

impl HttpsClient {
    pub async fn get(&self, url: Uri) -> Result<Response<Body>, hyper::Error> {
        self.client.get(url).await
    }

    pub async fn request(&self, request: Request<Body>) -> Result<Response<Body>, hyper::Error> {
        self.client.request(request).await
    }
}

impl Default for HttpsClient {
    fn default() -> Self {
        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(Duration::from_secs(3)));
        http.enforce_http(false);
        let https = HttpsConnector::new_with_connector(http);
        let mut connector = TimeoutConnector::new(https);
        connector.set_read_timeout(Some(Duration::from_secs(30)));
        connector.set_write_timeout(Some(Duration::from_secs(30)));

        Self {
            client: Client::builder().build::<_, hyper::Body>(connector),
        }
    }
}
