use paperclip::actix::web;

use crate::handlers;

pub fn config_app(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(handlers::health)))
        .service(
            web::scope("/api")
                .service(web::resource("/sweep").route(web::post().to(handlers::sweep)))
                .service(
                    web::scope("/book")
                        .service(web::resource("").route(web::post().to(handlers::add_book)))
                        .service(
                            web::scope("/{book_id}")
                                .service(web::resource("").route(web::get().to(handlers::get_book)))
                                .service(
                                    web::resource("/copies")
                                        .route(web::post().to(handlers::add_copies)),
                                )
                                .service(
                                    web::resource("/queue").route(web::get().to(handlers::get_queue)),
                                )
                                .service(
                                    web::resource("/reservations")
                                        .route(web::post().to(handlers::create_reservation)),
                                )
                                .service(
                                    web::resource("/requests")
                                        .route(web::post().to(handlers::submit_request)),
                                )
                                .service(
                                    web::resource("/issue")
                                        .route(web::post().to(handlers::issue_book)),
                                )
                                .service(
                                    web::resource("/availability")
                                        .route(web::post().to(handlers::availability_increased)),
                                ),
                        ),
                )
                .service(
                    web::resource("/requests/pending")
                        .route(web::get().to(handlers::pending_requests)),
                )
                .service(
                    web::scope("/request/{request_id}")
                        .service(
                            web::resource("/approve")
                                .route(web::post().to(handlers::approve_request)),
                        )
                        .service(
                            web::resource("/issue").route(web::post().to(handlers::issue_request)),
                        )
                        .service(
                            web::resource("/reject").route(web::post().to(handlers::reject_request)),
                        )
                        .service(
                            web::resource("/cancel").route(web::post().to(handlers::cancel_request)),
                        ),
                )
                .service(
                    web::resource("/reservation/{reservation_id}/cancel")
                        .route(web::post().to(handlers::cancel_reservation)),
                )
                .service(
                    web::scope("/patron/{patron_id}")
                        .service(
                            web::resource("/reservations")
                                .route(web::get().to(handlers::patron_reservations)),
                        )
                        .service(
                            web::resource("/loans").route(web::get().to(handlers::patron_loans)),
                        ),
                )
                .service(
                    web::resource("/loan/{loan_id}/return")
                        .route(web::post().to(handlers::return_loan)),
                )
                .service(
                    web::resource("/fine/{fine_id}/payments")
                        .route(web::post().to(handlers::record_payment)),
                ),
        );
}
