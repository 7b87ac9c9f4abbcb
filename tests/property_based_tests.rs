mod common;

use std::sync::Arc;

use futures::StreamExt;
use proptest::prelude::*;
use serde_json::json;

use common::strategies::*;
use queue_rpc::client::CallTracker;
use queue_rpc::config::RpcConfig;
use queue_rpc::messaging::{InMemoryBroker, PublishProperties, Transport};
use queue_rpc::protocol::{decode_value, encode_value, FunctionCall};

/// Issue one call per slot, then reply in `order`; every call must get its own reply
async fn replies_in_order(order: Vec<usize>) {
    let broker = InMemoryBroker::new();
    let config = RpcConfig::new("memory", "perm_queue");
    let client = CallTracker::new(Arc::new(broker.transport()), &config)
        .await
        .unwrap();
    let server_side = broker.transport();
    let mut work = server_side.consume("perm_queue").await.unwrap();

    let calls: Vec<_> = (0..order.len())
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { (i, client.call("id", json!(i)).await) })
        })
        .collect();

    let mut deliveries = Vec::with_capacity(order.len());
    for _ in 0..order.len() {
        deliveries.push(work.next().await.unwrap());
    }

    for &idx in &order {
        let delivery = &deliveries[idx];
        let call = FunctionCall::decode(&delivery.payload).unwrap();
        let reply = encode_value(&json!({"echo": call.data})).unwrap();
        server_side
            .publish(
                delivery.reply_to.as_deref().unwrap(),
                &reply,
                PublishProperties::reply(delivery.correlation_id.clone()),
            )
            .await
            .unwrap();
    }

    for call in calls {
        let (i, result) = call.await.unwrap();
        assert_eq!(result.unwrap(), json!({"echo": i}));
    }
    assert_eq!(client.pending_count(), 0);
    client.shutdown().await.unwrap();
}

proptest! {
    /// Property: any structured value survives reply encoding
    #[test]
    fn structured_values_round_trip(value in structured_value_strategy()) {
        let bytes = encode_value(&value).unwrap();
        prop_assert_eq!(decode_value(&bytes).unwrap(), value);
    }

    /// Property: finite floats come back bit-for-bit
    #[test]
    fn float_values_keep_full_precision(f in finite_f64()) {
        let value = serde_json::Value::from(f);
        let decoded = decode_value(&encode_value(&value).unwrap()).unwrap();
        prop_assert_eq!(decoded.as_f64().map(f64::to_bits), Some(f.to_bits()));
        prop_assert_eq!(decoded, value);
    }

    /// Property: call envelopes decode to the call that was encoded
    #[test]
    fn function_calls_round_trip(
        name in function_name_strategy(),
        data in structured_value_strategy(),
    ) {
        let call = FunctionCall::new(name, data);
        let bytes = call.encode().unwrap();
        prop_assert_eq!(FunctionCall::decode(&bytes).unwrap(), call);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: replies are matched by token alone, whatever order they arrive in
    #[test]
    fn replies_resolve_their_own_calls_in_any_order(order in permutation_strategy(12)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(replies_in_order(order));
    }
}
