pub mod flush;
pub mod wsroute;

use actix_web::web;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(wsroute::ws_handler)
        .service(flush::flush_handler)
        .route("/health", web::get().to(|| async { "OK" }));
}
