mod common;
use common::*;

use solarmax_bridge::config::PublishMode;
use solarmax_bridge::error::SolarMaxError;

fn three_inverters() -> Vec<SimulatedInverter> {
    vec![
        SimulatedInverter::new(1),
        SimulatedInverter::new(2),
        SimulatedInverter::new(3),
    ]
}

fn productions(messages: &[mqtt::Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .filter(|m| m.topic == "production")
        .map(|m| serde_json::from_str(&m.payload).unwrap())
        .collect()
}

#[tokio::test]
async fn publishes_every_inverter() -> Result<()> {
    common_setup();

    let gateway = SimulatedGateway::start(three_inverters()).await;
    let config = Factory::config(
        vec![Factory::gateway(gateway.port, vec![1, 2, 3])],
        PublishMode::All,
    );
    let channels = Channels::new();
    let mut to_mqtt = channels.to_mqtt.subscribe();
    let mut poller = Poller::new(config, channels);

    let cycle = poller.run_cycle().await?;
    assert_eq!(cycle.readings.len(), 3);
    assert!(cycle.shortfall().is_none());

    let reading = &cycle.readings[0];
    assert_eq!(reading.status, "MPP operation");
    assert!(reading.alarms.is_empty());
    assert_eq!(reading.reported_pac, 920.0);
    assert_eq!(reading.ac_voltage, 230.0);
    assert_eq!(reading.since.date().to_string(), "2024-12-31");

    let published = productions(&drain_messages(&mut to_mqtt));
    assert_eq!(published.len(), 3);
    assert_eq!(published[0]["inv"], 1);
    assert_eq!(published[0]["pac"], 920.0);
    assert_eq!(published[0]["eac"], 46);
    assert_eq!(published[0]["pdc"], 1000.0);
    assert_eq!(published[0]["edc"], 92);
    assert_eq!(published[0]["ivmax"], 2000.0);
    assert_eq!(published[0]["stat"], 20004);
    assert_eq!(published[2]["inv"], 3);

    Ok(())
}

#[tokio::test]
async fn dead_inverter_does_not_stop_the_others() -> Result<()> {
    common_setup();

    let gateway = SimulatedGateway::start(three_inverters()).await;
    let config = Factory::config(
        vec![Factory::gateway(gateway.port, vec![1, 2, 3])],
        PublishMode::All,
    );
    let channels = Channels::new();
    let mut to_mqtt = channels.to_mqtt.subscribe();
    let mut poller = Poller::new(config, channels);

    assert_eq!(poller.run_cycle().await?.readings.len(), 3);
    drain_messages(&mut to_mqtt);

    // 2 dies between cycles
    gateway.set_silent(2, true);

    let cycle = poller.run_cycle().await?;
    let addresses: Vec<u8> = cycle.readings.iter().map(|r| r.inverter).collect();
    assert_eq!(addresses, vec![1, 3]);
    assert_eq!((cycle.answered, cycle.expected), (2, 3));
    assert!(matches!(
        cycle.shortfall(),
        Some(SolarMaxError::CommunicationShortfall {
            read: 2,
            expected: 3
        })
    ));

    let published = productions(&drain_messages(&mut to_mqtt));
    assert_eq!(published.len(), 2);

    // and stays out of the following cycles until it answers again
    let readings = poller.run_cycle().await?.readings;
    assert_eq!(readings.len(), 2);

    gateway.set_silent(2, false);
    let readings = poller.run_cycle().await?.readings;
    assert_eq!(readings.len(), 3);

    Ok(())
}

#[tokio::test]
async fn alarmed_inverter_is_not_published() -> Result<()> {
    common_setup();

    let gateway = SimulatedGateway::start(vec![
        SimulatedInverter::new(1),
        SimulatedInverter::new(2).with(QueryField::SAL, "100"),
    ])
    .await;
    let config = Factory::config(
        vec![Factory::gateway(gateway.port, vec![1, 2])],
        PublishMode::All,
    );
    let channels = Channels::new();
    let mut to_mqtt = channels.to_mqtt.subscribe();
    let mut poller = Poller::new(config, channels);

    let readings = poller.run_cycle().await?.readings;
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].inverter, 1);
    assert_eq!(productions(&drain_messages(&mut to_mqtt)).len(), 1);

    Ok(())
}

#[tokio::test]
async fn publish_last_only() -> Result<()> {
    common_setup();

    let gateway = SimulatedGateway::start(three_inverters()).await;
    let config = Factory::config(
        vec![Factory::gateway(gateway.port, vec![1, 2, 3])],
        PublishMode::Last,
    );
    let channels = Channels::new();
    let mut to_mqtt = channels.to_mqtt.subscribe();
    let mut poller = Poller::new(config, channels);

    assert_eq!(poller.run_cycle().await?.readings.len(), 3);

    let published = productions(&drain_messages(&mut to_mqtt));
    assert_eq!(published.len(), 1);
    assert_eq!(published[0]["inv"], 3);

    Ok(())
}

#[tokio::test]
async fn gateways_are_polled_in_order() -> Result<()> {
    common_setup();

    let first = SimulatedGateway::start(vec![SimulatedInverter::new(1)]).await;
    let second = SimulatedGateway::start(vec![SimulatedInverter::new(7)]).await;
    let config = Factory::config(
        vec![
            Factory::gateway(first.port, vec![1]),
            Factory::gateway(second.port, vec![7]),
        ],
        PublishMode::All,
    );
    let mut poller = Poller::new(config, Channels::new());
    assert_eq!(poller.sessions().len(), 2);

    let addresses: Vec<u8> = poller
        .run_cycle()
        .await?
        .readings
        .iter()
        .map(|r| r.inverter)
        .collect();
    assert_eq!(addresses, vec![1, 7]);

    Ok(())
}

#[tokio::test]
async fn write_setting_command() -> Result<()> {
    common_setup();

    let gateway = SimulatedGateway::start(vec![SimulatedInverter::new(1)]).await;
    let config = Factory::config(
        vec![Factory::gateway(gateway.port, vec![1])],
        PublishMode::All,
    );
    let channels = Channels::new();
    let mut to_mqtt = channels.to_mqtt.subscribe();
    let mut poller = Poller::new(config, channels.clone());

    for (topic, payload) in [
        ("cmd/1/set", r#"{"PAC": 4000}"#),
        ("cmd/9/set", r#"{"PAC": 4000}"#),
    ] {
        channels
            .from_mqtt
            .send(mqtt::ChannelData::Message(mqtt::Message {
                topic: topic.to_string(),
                retain: false,
                payload: payload.to_string(),
            }))?;
    }

    poller.run_cycle().await?;

    let results: Vec<(String, String)> = drain_messages(&mut to_mqtt)
        .into_iter()
        .filter(|m| m.topic.starts_with("result/"))
        .map(|m| (m.topic, m.payload))
        .collect();
    assert_eq!(
        results,
        vec![
            ("result/1/set".to_string(), "OK".to_string()),
            ("result/9/set".to_string(), "FAIL".to_string()),
        ]
    );
    assert_eq!(
        gateway.writes(),
        vec![(1, vec![(QueryField::PAC, "FA0".to_string())])]
    );

    Ok(())
}

#[tokio::test]
async fn stops_on_shutdown() -> Result<()> {
    common_setup();

    let gateway = SimulatedGateway::start(vec![SimulatedInverter::new(1)]).await;
    let config = Factory::config(
        vec![Factory::gateway(gateway.port, vec![1])],
        PublishMode::All,
    );
    let channels = Channels::new();
    let mut to_mqtt = channels.to_mqtt.subscribe();
    let mut poller = Poller::new(config, channels);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(async move { poller.start(shutdown_rx).await });

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    shutdown_tx.send(())?;

    tokio::time::timeout(std::time::Duration::from_secs(2), handle).await???;

    // startup detection ran, then at least one cycle published
    assert!(gateway.connections() >= 2);
    assert!(!productions(&drain_messages(&mut to_mqtt)).is_empty());

    Ok(())
}
