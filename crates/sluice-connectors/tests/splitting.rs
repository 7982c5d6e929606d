//! Configured table assets split and sampled by the DataFusion engine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arrow::array::{Array, Date32Array, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use serde_json::json;
use sluice_connectors::{
    AssetConfig, AssetDefaults, Batch, ConfiguredAssetDataConnector, ConfiguredSource,
    DataConnector, Datasource,
};
use sluice_core::{
    BatchError, BatchRequest, IdentifierValue, InMemoryDataset, SamplingMethod, SplitterMethod,
};
use sluice_engine::{DataFusionEngine, ExecutionEngine};

const ROWS: i64 = 12;

fn trips() -> anyhow::Result<InMemoryDataset> {
    let regions = ["north", "south", "east"];
    let ids: Vec<i64> = (1..=ROWS).collect();
    let region: Vec<Option<&str>> = ids
        .iter()
        .map(|id| match id % 4 {
            0 => None,
            r => Some(regions[r as usize - 1]),
        })
        .collect();
    let fares: Vec<f64> = ids.iter().map(|id| *id as f64 * 1.5).collect();
    // Days since the epoch: ids divisible by 3 fall in January 2020, then
    // remainder 1 in February and remainder 2 in March.
    let month_starts = [18262, 18293, 18322];
    let pickup: Vec<i32> = ids
        .iter()
        .map(|id| month_starts[(id % 3) as usize] + *id as i32 - 1)
        .collect();
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("region", DataType::Utf8, true),
        Field::new("fare", DataType::Float64, false),
        Field::new("pickup", DataType::Date32, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(ids)),
            Arc::new(StringArray::from(region)),
            Arc::new(Float64Array::from(fares)),
            Arc::new(Date32Array::from(pickup)),
        ],
    )?;
    Ok(InMemoryDataset::from_batches(vec![batch])?)
}

fn datasource() -> Datasource {
    let engine = Arc::new(DataFusionEngine::new());
    engine.register_record_batches("trips", &trips().unwrap()).unwrap();
    let engine: Arc<dyn ExecutionEngine> = engine;

    let assets: BTreeMap<String, AssetConfig> = serde_json::from_value(json!({
        "trips_by_region": {
            "table": "trips",
            "splitter": {"method": "column_value", "column": "region"}
        },
        "trips_by_bucket": {
            "table": "trips",
            "splitter_method": "_split_on_mod_integer",
            "splitter_kwargs": {"column_name": "id", "mod": 3}
        },
        "trips_by_month": {
            "table": "trips",
            "splitter": {"method": "year_and_month", "column": "pickup"}
        },
        "sampled_trips": {
            "table": "trips",
            "sampling": {"method": "random", "p": 0.5, "seed": 7}
        }
    }))
    .unwrap();
    let connector = ConfiguredAssetDataConnector::new(
        "warehouse",
        "declared",
        ConfiguredSource::Tables {
            engine: engine.clone(),
        },
        &AssetDefaults::default(),
        &assets,
    )
    .unwrap();

    let mut datasource = Datasource::new("warehouse", engine);
    datasource.add_connector(Arc::new(connector)).unwrap();
    datasource
}

async fn ids(batch: &Batch) -> BTreeSet<i64> {
    let mut ids = BTreeSet::new();
    for record_batch in batch.data().collect().await.unwrap() {
        let column = record_batch
            .column_by_name("id")
            .unwrap()
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap()
            .clone();
        for i in 0..column.len() {
            ids.insert(column.value(i));
        }
    }
    ids
}

#[tokio::test]
async fn test_column_value_partitions_cover_table() {
    let datasource = datasource();
    let request = BatchRequest::new("warehouse", "declared", "trips_by_region");
    let batches = datasource.get_batch_list(&request).await.unwrap();

    let regions: Vec<IdentifierValue> = batches
        .iter()
        .map(|b| b.definition().batch_identifiers["region"].clone())
        .collect();
    assert_eq!(
        regions,
        vec![
            IdentifierValue::Null,
            IdentifierValue::from("east"),
            IdentifierValue::from("north"),
            IdentifierValue::from("south"),
        ]
    );

    let mut seen = BTreeSet::new();
    for batch in &batches {
        assert_eq!(batch.data().row_count().await.unwrap(), 3);
        for id in ids(batch).await {
            assert!(seen.insert(id), "id {} appears in two partitions", id);
        }
    }
    assert_eq!(seen, (1..=ROWS).collect::<BTreeSet<_>>());
}

#[tokio::test]
async fn test_partition_by_identifier_and_predicate() {
    let datasource = datasource();
    let request = BatchRequest::new("warehouse", "declared", "trips_by_region")
        .with_identifier("region", "north");
    let batch = datasource.get_single_batch(&request).await.unwrap();
    assert_eq!(ids(&batch).await, BTreeSet::from([1, 5, 9]));

    let request = BatchRequest::new("warehouse", "declared", "trips_by_region")
        .with_identifier("region", IdentifierValue::Null);
    let batch = datasource.get_single_batch(&request).await.unwrap();
    assert_eq!(ids(&batch).await, BTreeSet::from([4, 8, 12]));
}

#[tokio::test]
async fn test_mod_integer_split_from_legacy_config() {
    let datasource = datasource();
    let request = BatchRequest::new("warehouse", "declared", "trips_by_bucket");
    let definitions = datasource.get_batch_definition_list(&request).await.unwrap();
    let buckets: Vec<_> = definitions
        .iter()
        .map(|d| d.batch_identifiers["id"].clone())
        .collect();
    assert_eq!(
        buckets,
        vec![
            IdentifierValue::Int(0),
            IdentifierValue::Int(1),
            IdentifierValue::Int(2)
        ]
    );

    // "1" matches the integer bucket.
    let request = request.with_identifier("id", "1");
    let batch = datasource.get_single_batch(&request).await.unwrap();
    assert_eq!(
        batch.spec().splitter,
        Some(SplitterMethod::ModInteger {
            column: "id".to_string(),
            modulus: 3
        })
    );
    assert_eq!(ids(&batch).await, BTreeSet::from([1, 4, 7, 10]));
}

#[tokio::test]
async fn test_year_and_month_partitions_keyed_by_column() {
    let datasource = datasource();
    let request = BatchRequest::new("warehouse", "declared", "trips_by_month");
    let definitions = datasource.get_batch_definition_list(&request).await.unwrap();
    for definition in &definitions {
        assert_eq!(
            definition.batch_identifiers.keys().collect::<Vec<_>>(),
            vec!["pickup"]
        );
    }
    let months: Vec<_> = definitions
        .iter()
        .map(|d| d.batch_identifiers["pickup"].clone())
        .collect();
    assert_eq!(
        months,
        vec![
            IdentifierValue::from("2020-01"),
            IdentifierValue::from("2020-02"),
            IdentifierValue::from("2020-03"),
        ]
    );

    let request = request.with_identifier("pickup", "2020-02");
    let batch = datasource.get_single_batch(&request).await.unwrap();
    assert_eq!(ids(&batch).await, BTreeSet::from([1, 4, 7, 10]));
}

#[tokio::test]
async fn test_split_then_sample() {
    let datasource = datasource();
    let request = BatchRequest::new("warehouse", "declared", "trips_by_region")
        .with_identifier("region", "south")
        .with_sampling(SamplingMethod::Limit {
            n: 2,
            order_by: vec!["fare".to_string()],
        });
    let batch = datasource.get_single_batch(&request).await.unwrap();
    assert_eq!(ids(&batch).await, BTreeSet::from([2, 6]));
}

#[tokio::test]
async fn test_asset_sampling_is_deterministic() {
    let datasource = datasource();
    let request = BatchRequest::new("warehouse", "declared", "sampled_trips");
    let first = datasource.get_single_batch(&request).await.unwrap();
    let second = datasource.get_single_batch(&request).await.unwrap();

    assert!(matches!(
        first.spec().sampling,
        Some(SamplingMethod::Random { seed: 7, .. })
    ));
    let sampled = ids(&first).await;
    assert!(sampled.is_subset(&(1..=ROWS).collect()));
    assert_eq!(sampled, ids(&second).await);
    assert_eq!(
        datasource.get_batch_fingerprint(&first).await.unwrap(),
        datasource.get_batch_fingerprint(&second).await.unwrap()
    );

    // A request-level method replaces the asset's sampling.
    let overridden = request.with_sampling(SamplingMethod::AList {
        column: "region".to_string(),
        values: vec![IdentifierValue::from("east")],
    });
    let batch = datasource.get_single_batch(&overridden).await.unwrap();
    assert_eq!(ids(&batch).await, BTreeSet::from([3, 7, 11]));
}

#[tokio::test]
async fn test_unknown_configured_asset() {
    let datasource = datasource();
    let connector = datasource.connector("declared").unwrap();
    assert_eq!(connector.list_available_data_asset_names().await.unwrap().len(), 4);

    let request = BatchRequest::new("warehouse", "declared", "trips_by_day");
    let err = datasource.get_batch_list(&request).await.unwrap_err();
    assert!(matches!(err, BatchError::AssetNotFound { .. }));
}
