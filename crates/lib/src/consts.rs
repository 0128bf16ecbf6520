pub const APP_NAME: &str = "fnbox";

/// Prefix applied to every image this tool builds.
pub const IMAGE_PREFIX: &str = "fnbox";

pub const DEFAULT_REGISTRY: &str = "registry:5010";
pub const DEFAULT_REGISTRY_PORT: u16 = 5010;
pub const DEFAULT_BUILDER_NAME: &str = "fnbox-buildx";

/// Port key reported by the port discoverer for the registry.
pub const REGISTRY_PORT_KEY: &str = "FNBOX_PORT_REGISTRY";

// Named locks
pub const LOCK_BUILDX: &str = "buildx";
pub const LOCK_BAKE: &str = "bake";
pub const LOCK_BASE_IMAGES: &str = "base-images";
pub const LOCK_DEPLOY: &str = "deploy";

// Image labels
pub const LABEL_MANAGED: &str = "dev.fnbox.managed";
pub const LABEL_PROJECT: &str = "dev.fnbox.project";
pub const LABEL_ENV: &str = "dev.fnbox.env";
pub const LABEL_KIND: &str = "dev.fnbox.kind";
pub const LABEL_CA_FINGERPRINT: &str = "dev.fnbox.ca_fingerprint";
pub const LABEL_IMAGE_FINGERPRINT: &str = "dev.fnbox.image_fingerprint";

pub const KIND_FUNCTION: &str = "function";

// Staged config files, relative to the output directory
pub const CONFIG_DIR: &str = "config";
pub const FUNCTIONS_FILE: &str = "functions.yml";
pub const ROUTING_FILE: &str = "routing.yml";
pub const RESOURCES_FILE: &str = "resources.yml";
pub const IMAGE_IMPORT_FILE: &str = "image-import.json";

pub const BAKE_FILE: &str = "docker-bake.hcl";
pub const BAKE_CACHE_DIR: &str = ".bake-cache";

pub const ROOT_CA_SECRET_ID: &str = "fnbox_root_ca";
pub const ROOT_CA_FILENAME: &str = "rootCA.crt";

/// Fingerprints keep the first 4 bytes of the digest (8 hex characters).
pub const FINGERPRINT_BYTES: usize = 4;
