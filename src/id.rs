use ulid::Ulid;

const DEPLOYMENT_ID_PREFIX: &str = "dep_";

pub fn new_deployment_id() -> String {
    format!("{DEPLOYMENT_ID_PREFIX}{}", Ulid::new())
}

pub fn is_deployment_id(s: &str) -> bool {
    s.strip_prefix(DEPLOYMENT_ID_PREFIX)
        .is_some_and(|rest| Ulid::from_string(rest).is_ok())
}
