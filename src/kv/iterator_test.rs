use super::*;
use crate::Error;
use crate::ErrorKind;

fn pairs(keys: &[&str]) -> Vec<KvPair> {
    keys.iter()
        .enumerate()
        .map(|(i, k)| KvPair {
            key: k.to_string(),
            value: vec![i as u8],
            revision: i as u64 + 1,
        })
        .collect()
}

#[tokio::test]
async fn snapshot_iterator_stays_done_after_exhaustion() {
    let mut iter = KvIterator::from_vec(pairs(&["a", "b"]));

    assert_eq!(iter.next().await.unwrap().unwrap().key, "a");
    assert_eq!(iter.next().await.unwrap().unwrap().key, "b");
    assert!(iter.next().await.unwrap().is_none());
    assert!(iter.next().await.unwrap().is_none());
}

#[tokio::test]
async fn close_is_idempotent_and_fails_later_calls() {
    let mut iter = KvIterator::from_vec(pairs(&["a"]));

    iter.close();
    iter.close();
    assert!(iter.is_closed());
    assert_eq!(iter.next().await.unwrap_err().kind(), ErrorKind::Closed);
}

#[tokio::test]
async fn lazy_iterator_pulls_on_demand_and_surfaces_errors() {
    let source = vec![
        Ok(KeyVal {
            key: "a".into(),
            revision: 1,
        }),
        Err(Error::unavailable("cursor broke")),
    ];
    let mut iter = KeyIterator::from_lazy(source.into_iter());

    assert_eq!(iter.next().await.unwrap().unwrap().key, "a");
    assert_eq!(iter.next().await.unwrap_err().kind(), ErrorKind::Unavailable);
}

#[tokio::test]
async fn mappers_transform_and_skip_items() {
    let iter = KvIterator::from_vec(pairs(&["/p/a", "/q/b", "/p/c"]))
        .filter_map(|mut kv| {
            Ok(kv.key.strip_prefix("/p/").map(str::to_string).map(|k| {
                kv.key = k;
                kv
            }))
        })
        .map(|mut kv| {
            kv.value.push(0xff);
            Ok(kv)
        });

    let items = iter.try_collect().await.unwrap();
    let keys: Vec<_> = items.iter().map(|kv| kv.key.as_str()).collect();
    assert_eq!(keys, vec!["a", "c"]);
    assert!(items.iter().all(|kv| kv.value.last() == Some(&0xff)));
}

#[tokio::test]
async fn mapper_error_is_returned_to_the_caller() {
    let mut iter = KvIterator::from_vec(pairs(&["a"])).map(|_| Err(Error::invalid("bad value")));

    assert_eq!(iter.next().await.unwrap_err().kind(), ErrorKind::Invalid);
}
