use chrono::Utc;
use draupnir_engine::test_utils::{open_engine, stage_artifact, test_config, FakeRuntime};
use draupnir_engine::Engine;
use rcgen::KeyPair;
use tempfile::tempdir;
use x509_parser::pem::parse_x509_pem;

async fn ready_image(engine: &Engine) -> u64 {
    let image = engine.images.create(Utc::now(), None).await.unwrap();
    stage_artifact(engine, image.id).await;
    engine.images.finalize(image.id).await.unwrap();
    image.id
}

fn der_of(pem: &str) -> Vec<u8> {
    let (_, pem) = parse_x509_pem(pem.as_bytes()).unwrap();
    pem.contents
}

#[tokio::test]
async fn test_client_credential_validates_against_returned_ca() {
    let temp_dir = tempdir().unwrap();
    let engine = open_engine(test_config(temp_dir.path()), FakeRuntime::new()).await;
    let image_id = ready_image(&engine).await;

    let provisioned = engine.instances.provision(image_id).await.unwrap();
    let credential = provisioned.instance.credential.clone().unwrap();
    let key_pem = provisioned.client_key.into_pem();

    let ca_der = der_of(&credential.ca_certificate);
    let (_, ca) = x509_parser::parse_x509_certificate(&ca_der).unwrap();
    let leaf_der = der_of(&credential.client_certificate);
    let (_, leaf) = x509_parser::parse_x509_certificate(&leaf_der).unwrap();

    assert_eq!(leaf.issuer().as_raw(), ca.subject().as_raw());
    leaf.verify_signature(Some(ca.public_key())).unwrap();
    assert!(ca.is_ca());
    assert!(leaf
        .subject()
        .to_string()
        .contains(&format!("draupnir-instance-{}", provisioned.instance.id)));
    assert!(leaf.validity().is_valid());

    let key = KeyPair::from_pem(&key_pem).unwrap();
    assert_eq!(
        key.public_key_raw(),
        leaf.public_key().subject_public_key.data.as_ref()
    );
}

#[tokio::test]
async fn test_server_certificate_installed_in_clone() {
    let temp_dir = tempdir().unwrap();
    let engine = open_engine(test_config(temp_dir.path()), FakeRuntime::new()).await;
    let image_id = ready_image(&engine).await;
    let instance = engine.instances.provision(image_id).await.unwrap().instance;
    let credential = instance.credential.unwrap();

    let server_pem = std::fs::read_to_string(
        temp_dir
            .path()
            .join("instances")
            .join(instance.id.to_string())
            .join("server.crt"),
    )
    .unwrap();
    let ca_der = der_of(&credential.ca_certificate);
    let (_, ca) = x509_parser::parse_x509_certificate(&ca_der).unwrap();
    let server_der = der_of(&server_pem);
    let (_, server) = x509_parser::parse_x509_certificate(&server_der).unwrap();
    server.verify_signature(Some(ca.public_key())).unwrap();
}

#[tokio::test]
async fn test_ca_is_stable_and_key_is_not_stored() {
    let temp_dir = tempdir().unwrap();
    let config = test_config(temp_dir.path());
    let (first_ca, instance_id, key_pem) = {
        let engine = open_engine(config.clone(), FakeRuntime::new()).await;
        let image_id = ready_image(&engine).await;
        let provisioned = engine.instances.provision(image_id).await.unwrap();
        let ca = provisioned.instance.credential.clone().unwrap().ca_certificate;
        (ca, provisioned.instance.id, provisioned.client_key.into_pem())
    };

    let engine = open_engine(config, FakeRuntime::new()).await;
    let instance = engine.instances.get(instance_id).await.unwrap();
    let credential = instance.credential.unwrap();
    assert_eq!(credential.ca_certificate, first_ca);
    assert!(credential.fingerprint.starts_with("sha256:"));

    // The private key never reaches disk
    let key_body = key_pem.lines().nth(1).unwrap().to_string();
    let state = temp_dir.path().join("state/instances");
    for entry in std::fs::read_dir(state).unwrap() {
        let contents = std::fs::read_to_string(entry.unwrap().path()).unwrap();
        assert!(!contents.contains("PRIVATE KEY"));
        assert!(!contents.contains(&key_body));
    }
}
