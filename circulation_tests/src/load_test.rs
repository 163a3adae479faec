use std::collections::HashSet;

use futures_util::future::join_all;
use rand::prelude::SliceRandom;
use rand::{thread_rng, Rng};

use circulation_service::api::{BookDetails, BookId, PatronId};
use circulation_service::client::CirculationClient;

const SERVICE_URL: &str = "http://127.0.0.1:8080";

#[tokio::test]
/// Hammers a few empty books with concurrent reservations
/// Random patrons reserve random books at the same time, duplicates are refused
/// Every queue ends up densely numbered with one entry per patron
/// Restocking drains the head of each queue and the rest is renumbered
async fn concurrent_reservations_keep_queues_dense() {
    const NO_OF_BOOKS: usize = 5;
    const NO_OF_PATRONS: usize = 30;
    const NO_OF_RESERVATIONS: usize = 200;
    const COPIES_TO_ADD: i32 = 3;

    let mut rng = thread_rng();
    let client = CirculationClient::new(SERVICE_URL).expect("Failed to create client");

    let mut book_ids = vec![];
    for no in 0..NO_OF_BOOKS {
        let book_id = client
            .add_book(BookDetails {
                title: format!("Load test volume {} {}", no, rng.gen_range(0..100_000)),
                total_copies: COPIES_TO_ADD,
            })
            .await
            .expect("Failed to add book");
        // Empty the shelf so every reservation has to queue
        for _ in 0..COPIES_TO_ADD {
            client
                .issue_book(book_id, 0, None)
                .await
                .expect("Failed to issue book")
                .expect("No copy on the shelf");
        }
        book_ids.push(book_id);
        println!("Added book {}", book_id);
    }

    let patron_base: PatronId = rng.gen_range(1_000_000..2_000_000);
    let patron_ids: Vec<PatronId> = (0..NO_OF_PATRONS as i32)
        .map(|no| patron_base + no)
        .collect();
    let attempts: Vec<(BookId, PatronId)> = (0..NO_OF_RESERVATIONS)
        .map(|_| {
            (
                *book_ids.choose(&mut rng).unwrap(),
                *patron_ids.choose(&mut rng).unwrap(),
            )
        })
        .collect();

    let results = join_all(
        attempts
            .iter()
            .map(|(book_id, patron_id)| client.create_reservation(*book_id, *patron_id, "")),
    )
    .await;

    let mut expected: HashSet<(BookId, PatronId)> = HashSet::default();
    for (attempt, result) in attempts.iter().zip(results) {
        let created = result.expect("Failed to reserve book").is_some();
        if created {
            assert!(expected.insert(*attempt), "Patron queued twice {:?}", attempt);
        }
    }
    assert_eq!(
        expected,
        attempts.iter().copied().collect::<HashSet<_>>(),
        "Every distinct patron and book pair should be queued once"
    );

    for book_id in &book_ids {
        let queue = client.queue(*book_id).await.expect("Failed to get queue");
        let priorities: Vec<i32> = queue.iter().map(|r| r.priority).collect();
        assert_eq!(priorities, (1..=queue.len() as i32).collect::<Vec<_>>());
        println!("Book {} has {} patrons waiting", book_id, queue.len());

        let before = queue.len();
        let restocked = client
            .add_copies(*book_id, COPIES_TO_ADD)
            .await
            .expect("Failed to add copies");
        let served = before.min(COPIES_TO_ADD as usize);
        assert_eq!(
            restocked.available_copies,
            COPIES_TO_ADD - served as i32,
            "Copies should go to the queue first"
        );

        let queue = client.queue(*book_id).await.expect("Failed to get queue");
        assert_eq!(queue.len(), before - served);
        let priorities: Vec<i32> = queue.iter().map(|r| r.priority).collect();
        assert_eq!(priorities, (1..=queue.len() as i32).collect::<Vec<_>>());
    }
}
