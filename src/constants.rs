pub const KAISER_FHIR_BASE_URL: &str =
    "https://kpx-service-bus.kp.org/service/hp/mhpo/healthplanproviderv1rc/";
pub const UNITED_FHIR_BASE_URL: &str = "https://public.fhir.flex.optum.com/R4/";
pub const ANTHEM_FHIR_BASE_URL: &str = "https://cmsmanapi.anthem.com/fhir/cms_mandate/mcd/";

pub const DEFAULT_NOMINATIM_BASE_URL: &str = "https://nominatim.openstreetmap.org/";
pub const NOMINATIM_USAGE_POLICY_URL: &str = "https://operations.osmfoundation.org/policies/nominatim/";

pub const USER_AGENT: &str = "provider-directory-scraper/0.1";

pub const DEFAULT_STATE: &str = "CA";

pub const KAISER_NETWORKS: &[(&str, &str)] = &[
    (
        "Exclusive_Provider_Organization_(EPO)_CN",
        "Kaiser EPO Network",
    ),
    ("HMO_CN", "Kaiser HMO Network"),
    ("Medi-Cal_Managed_Care_CN", "Kaiser Medi-Cal Network"),
    (
        "Point-of-Service_Plan_(POS)_CN",
        "Kaiser Point-of-Service Network",
    ),
    ("Senior_Advantage_CN", "Kaiser Senior Advantage Network"),
];

/// Carrier names searched for in translated network text, in priority order.
pub const KNOWN_CARRIERS: &[(&str, &str)] = &[
    ("Aetna", "AT"),
    ("Anthem", "AN"),
    ("Blue Shield", "BS"),
    ("Cigna", "CG"),
    ("Kaiser", "KP"),
    ("Oscar Health", "OS"),
    ("UnitedHealthcare", "UN"),
];

pub const NOT_ACCEPTING_PATIENTS: &str = "Not accepting patients";
pub const UNRECOGNIZED_NETWORK: &str = "Unrecognized network";
pub const NOT_LISTED: &str = "Not listed";
pub const NOT_AVAILABLE: &str = "N/A";
