/// Integration tests against a real PostgreSQL server
///
/// These tests verify the PostgreSQL source and destination end to end:
/// 1. Watermark on a missing, empty and populated table
/// 2. ON CONFLICT DO UPDATE overwrites instead of duplicating
/// 3. A failing chunk rolls back completely
/// 4. DISTINCT ON extraction keeps the latest source row
/// 5. A full driver cycle from source tables to destination table
/// 6. Meteorological sensor rows pivot into one reading, latest id wins
///
/// Prerequisites:
/// - A disposable PostgreSQL database (the tests create tables in it)
/// - TEST_DATABASE_URL set in .env
///
/// Run with: cargo test --test postgres_roundtrip -- --ignored --test-threads=1

use chrono::{DateTime, Duration, TimeZone, Utc};
use nimbus_sync::config::{DbParams, Role};
use nimbus_sync::daemon::{DriverConfig, SyncDriver};
use nimbus_sync::extract::{ExtractFilter, PostgresSource, Source};
use nimbus_sync::model::{
    Measurements, MeteorologicalMeasurements, RainfallMeasurements, Reading, SyncError, Variant,
};
use nimbus_sync::upsert::{Destination, PostgresDestination};
use postgres::{Client, NoTls};
use rust_decimal::Decimal;
use std::env;

/// Station ids used by these tests; real NIMBUS stations are far below.
const TEST_STATION_BASE: i32 = 990_000;

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

fn test_url() -> String {
    dotenv::dotenv().ok();
    env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set")
}

fn setup_test_db() -> Client {
    Client::connect(&test_url(), NoTls).expect("Failed to connect to test database")
}

fn params(role: Role) -> DbParams {
    let url = test_url();
    let var = match role {
        Role::Source => "SOURCE_DATABASE_URL",
        Role::Destination => "DESTINATION_DATABASE_URL",
    };
    DbParams::from_lookup(role, &|name| (name == var).then(|| url.clone())).expect("valid test URL")
}

fn fresh_destination(client: &mut Client, table: &str) -> PostgresDestination {
    client
        .batch_execute(&format!("DROP TABLE IF EXISTS {}", table))
        .expect("drop should succeed");
    PostgresDestination::new(params(Role::Destination), table, Variant::Rainfall)
}

fn t(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2009, 2, 16, 4, 0, 0).unwrap() + Duration::minutes(minutes)
}

fn reading(minutes: i64, station: i32, h24: Decimal) -> Reading {
    Reading {
        timestamp: t(minutes),
        station_id: station,
        station_name: format!("Test station {}", station),
        measurements: Measurements::Rainfall(RainfallMeasurements {
            h24: Some(h24),
            ..Default::default()
        }),
    }
}

/// Minimal copies of the NIMBUS source tables, created when missing.
fn create_source_tables(client: &mut Client) {
    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS public.estacoes_estacao (
                id INTEGER PRIMARY KEY,
                nome VARCHAR(255)
             );
             CREATE TABLE IF NOT EXISTS public.estacoes_leitura (
                id BIGINT PRIMARY KEY,
                \"horaLeitura\" TIMESTAMPTZ NOT NULL,
                estacao_id INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS public.estacoes_leiturachuva (
                id BIGSERIAL PRIMARY KEY,
                leitura_id BIGINT NOT NULL,
                m05 NUMERIC, m10 NUMERIC, m15 NUMERIC, h01 NUMERIC,
                h04 NUMERIC, h24 NUMERIC, h96 NUMERIC
             );
             CREATE TABLE IF NOT EXISTS public.estacoes_sensor (
                id INTEGER PRIMARY KEY,
                nome VARCHAR(255) NOT NULL
             );
             CREATE TABLE IF NOT EXISTS public.estacoes_leiturasensor (
                id BIGSERIAL PRIMARY KEY,
                leitura_id BIGINT NOT NULL,
                sensor_id INTEGER NOT NULL,
                valor NUMERIC
             );",
        )
        .expect("source tables should be created");
}

fn cleanup_source_rows(client: &mut Client) {
    let lo = TEST_STATION_BASE;
    let _ = client.execute(
        "DELETE FROM public.estacoes_leiturasensor WHERE leitura_id IN
            (SELECT id FROM public.estacoes_leitura WHERE estacao_id >= $1)",
        &[&lo],
    );
    let _ = client.execute(
        "DELETE FROM public.estacoes_leiturachuva WHERE leitura_id IN
            (SELECT id FROM public.estacoes_leitura WHERE estacao_id >= $1)",
        &[&lo],
    );
    let _ = client.execute("DELETE FROM public.estacoes_leitura WHERE estacao_id >= $1", &[&lo]);
    let _ = client.execute("DELETE FROM public.estacoes_estacao WHERE id >= $1", &[&lo]);
}

fn insert_source_row(client: &mut Client, id: i64, minutes: i64, station: i32, h24: Decimal) {
    client
        .execute(
            "INSERT INTO public.estacoes_estacao (id, nome) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
            &[&station, &format!("Test station {}", station)],
        )
        .expect("station insert");
    client
        .execute(
            "INSERT INTO public.estacoes_leitura (id, \"horaLeitura\", estacao_id) VALUES ($1, $2, $3)",
            &[&id, &t(minutes), &station],
        )
        .expect("reading insert");
    client
        .execute(
            "INSERT INTO public.estacoes_leiturachuva (leitura_id, h24) VALUES ($1, $2)",
            &[&id, &h24],
        )
        .expect("rainfall insert");
}

const SENSORS: [(i32, &str); 6] = [
    (TEST_STATION_BASE + 1, "Chuva"),
    (TEST_STATION_BASE + 2, "Direção Vento"),
    (TEST_STATION_BASE + 3, "Velocidade Vento"),
    (TEST_STATION_BASE + 4, "Temperatura do Ar"),
    (TEST_STATION_BASE + 5, "Pressão Atmosférica"),
    (TEST_STATION_BASE + 6, "Umidade do Ar"),
];

/// One weather reading stored as one row per sensor. `local_time` carries
/// its own offset, as the source's history mixes -02:00 and -03:00.
fn insert_sensor_reading(client: &mut Client, id: i64, local_time: &str, station: i32, values: [Decimal; 6]) {
    for (sensor_id, name) in SENSORS {
        client
            .execute(
                "INSERT INTO public.estacoes_sensor (id, nome) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
                &[&sensor_id, &name],
            )
            .expect("sensor insert");
    }
    client
        .execute(
            "INSERT INTO public.estacoes_estacao (id, nome) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
            &[&station, &format!("Test station {}", station)],
        )
        .expect("station insert");
    client
        .execute(
            "INSERT INTO public.estacoes_leitura (id, \"horaLeitura\", estacao_id) VALUES ($1, $2::text::timestamptz, $3)",
            &[&id, &local_time, &station],
        )
        .expect("reading insert");
    for ((sensor_id, _), value) in SENSORS.iter().zip(values) {
        client
            .execute(
                "INSERT INTO public.estacoes_leiturasensor (leitura_id, sensor_id, valor) VALUES ($1, $2, $3)",
                &[&id, sensor_id, &value],
            )
            .expect("sensor value insert");
    }
}

fn test_filter() -> ExtractFilter {
    ExtractFilter::all().stations(TEST_STATION_BASE, i32::MAX)
}

// ---------------------------------------------------------------------------
// 1-3. Destination
// ---------------------------------------------------------------------------

#[test]
#[ignore] // Only run when database is available
fn test_watermark_missing_empty_and_populated() {
    let mut client = setup_test_db();
    let mut dest = fresh_destination(&mut client, "nimbus_test_watermark");

    assert_eq!(dest.read_watermark().unwrap(), None, "missing table has no watermark");

    dest.ensure_table().unwrap();
    assert_eq!(dest.read_watermark().unwrap(), None, "empty table has no watermark");

    dest.upsert_chunk(&[reading(0, 1, Decimal::ONE), reading(15, 2, Decimal::ONE)])
        .unwrap();
    assert_eq!(dest.read_watermark().unwrap(), Some(t(15)));
}

#[test]
#[ignore] // Only run when database is available
fn test_upsert_overwrites_existing_keys() {
    let mut client = setup_test_db();
    let mut dest = fresh_destination(&mut client, "nimbus_test_overwrite");
    dest.ensure_table().unwrap();

    dest.upsert_chunk(&[reading(0, 14, Decimal::new(130, 1))]).unwrap();
    dest.upsert_chunk(&[reading(0, 14, Decimal::new(110, 1))]).unwrap();

    assert_eq!(dest.row_count().unwrap(), 1);
    let stored = dest.fetch(&ExtractFilter::all()).unwrap();
    assert_eq!(stored, vec![reading(0, 14, Decimal::new(110, 1))]);
}

#[test]
#[ignore] // Only run when database is available
fn test_duplicate_keys_in_one_chunk_resolve_to_last() {
    let mut client = setup_test_db();
    let mut dest = fresh_destination(&mut client, "nimbus_test_chunk_dups");
    dest.ensure_table().unwrap();

    let written = dest
        .upsert_chunk(&[reading(0, 1, Decimal::ONE), reading(0, 1, Decimal::TWO)])
        .unwrap();
    assert_eq!(written, 1);
    assert_eq!(dest.fetch(&ExtractFilter::all()).unwrap(), vec![reading(0, 1, Decimal::TWO)]);
}

#[test]
#[ignore] // Only run when database is available
fn test_failing_chunk_rolls_back_entirely() {
    let mut client = setup_test_db();
    let mut dest = fresh_destination(&mut client, "nimbus_test_atomic");
    dest.ensure_table().unwrap();
    dest.upsert_chunk(&[reading(0, 1, Decimal::ONE)]).unwrap();

    // station_name is VARCHAR(255); the middle row violates it
    let mut bad = reading(10, 2, Decimal::ONE);
    bad.station_name = "x".repeat(300);
    let chunk = vec![reading(5, 1, Decimal::ONE), bad, reading(15, 3, Decimal::ONE)];

    let err = dest.upsert_chunk(&chunk).unwrap_err();
    assert!(matches!(err, SyncError::Query { .. }), "{:?}", err);
    assert_eq!(dest.row_count().unwrap(), 1, "no row of the failed chunk may remain");
    assert_eq!(dest.read_watermark().unwrap(), Some(t(0)));
}

// ---------------------------------------------------------------------------
// 4-5. Source and full cycle
// ---------------------------------------------------------------------------

#[test]
#[ignore] // Only run when database is available
fn test_extraction_keeps_latest_source_row() {
    let mut client = setup_test_db();
    create_source_tables(&mut client);
    cleanup_source_rows(&mut client);

    let station = TEST_STATION_BASE + 14;
    insert_source_row(&mut client, 9_900_100, 12, station, Decimal::new(125, 1));
    insert_source_row(&mut client, 9_900_105, 12, station, Decimal::new(130, 1));
    insert_source_row(&mut client, 9_900_101, 27, station, Decimal::ONE);

    let mut source = PostgresSource::new(params(Role::Source), Variant::Rainfall);
    let readings: Vec<Reading> = source
        .extract(&test_filter(), 1)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
        .concat();

    assert_eq!(readings.len(), 2);
    assert_eq!(readings[0].timestamp, t(12));
    assert_eq!(readings[0].measurements, reading(12, station, Decimal::new(130, 1)).measurements);
    assert_eq!(readings[1].timestamp, t(27));

    cleanup_source_rows(&mut client);
}

#[test]
#[ignore] // Only run when database is available
fn test_driver_cycle_between_databases() {
    let mut client = setup_test_db();
    create_source_tables(&mut client);
    cleanup_source_rows(&mut client);

    let station = TEST_STATION_BASE + 1;
    for i in 0..25 {
        insert_source_row(&mut client, 9_901_000 + i, i * 5, station, Decimal::from(i));
    }

    let mut dest = fresh_destination(&mut client, "nimbus_test_cycle");
    dest.ensure_table().unwrap();
    dest.upsert_chunk(&[reading(0, station, Decimal::ZERO)]).unwrap();

    let config = DriverConfig {
        chunk_size: 10,
        retry_backoff: std::time::Duration::ZERO,
        ..DriverConfig::default()
    };
    let source = PostgresSource::new(params(Role::Source), Variant::Rainfall);
    let mut driver = SyncDriver::new(source, dest, config);

    assert_eq!(driver.run_once().unwrap(), 24, "everything after the seeded reading");
    assert_eq!(driver.run_once().unwrap(), 0, "second cycle finds nothing new");
    assert_eq!(driver.destination_mut().read_watermark().unwrap(), Some(t(120)));

    cleanup_source_rows(&mut client);
}

#[test]
#[ignore] // Only run when database is available
fn test_meteorological_pivot_keeps_latest_reading() {
    let mut client = setup_test_db();
    create_source_tables(&mut client);
    cleanup_source_rows(&mut client);

    // the same instant written twice, under the summer and the standard offset
    let station = TEST_STATION_BASE + 32;
    let older = [1, 180, 2, 30, 1010, 70].map(Decimal::from);
    let newer = [
        Decimal::new(2, 1),
        Decimal::from(190),
        Decimal::new(35, 1),
        Decimal::new(287, 1),
        Decimal::new(10125, 1),
        Decimal::from(68),
    ];
    insert_sensor_reading(&mut client, 9_902_001, "2009-02-16 02:12:20-02", station, older);
    insert_sensor_reading(&mut client, 9_902_002, "2009-02-16 01:12:20-03", station, newer);

    let mut source = PostgresSource::new(params(Role::Source), Variant::Meteorological);
    let readings: Vec<Reading> = source
        .extract(&test_filter(), 100)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
        .concat();

    let [rain, wind_direction, wind_speed, temperature, pressure, humidity] = newer;
    let expected = Reading {
        timestamp: Utc.with_ymd_and_hms(2009, 2, 16, 4, 12, 20).unwrap(),
        station_id: station,
        station_name: format!("Test station {}", station),
        measurements: Measurements::Meteorological(MeteorologicalMeasurements {
            rain: Some(rain),
            wind_direction: Some(wind_direction),
            wind_speed: Some(wind_speed),
            temperature: Some(temperature),
            pressure: Some(pressure),
            humidity: Some(humidity),
        }),
    };
    assert_eq!(readings, vec![expected.clone()], "one reading per instant, from the greater id");

    client
        .batch_execute("DROP TABLE IF EXISTS nimbus_test_weather")
        .expect("drop should succeed");
    let mut dest = PostgresDestination::new(params(Role::Destination), "nimbus_test_weather", Variant::Meteorological);
    dest.ensure_table().unwrap();
    assert_eq!(dest.upsert_chunk(&readings).unwrap(), 1);
    assert_eq!(dest.fetch(&ExtractFilter::all()).unwrap(), vec![expected]);
    assert_eq!(dest.read_watermark().unwrap(), Some(t(12) + Duration::seconds(20)));

    cleanup_source_rows(&mut client);
}
