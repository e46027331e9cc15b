use std::fs;

use leafscope::{ClassIndexError, ClassIndexTable};

#[test]
fn test_directory_scan_orders_by_name() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    for name in ["tomato", "apple", "corn"] {
        fs::create_dir(dir.path().join(name))?;
    }
    // Files next to the class folders are ignored
    fs::write(dir.path().join("README.txt"), "not a class")?;

    let table = ClassIndexTable::from_directory(dir.path())?;
    assert_eq!(table.len(), 3);
    assert_eq!(table.label(0), "apple");
    assert_eq!(table.label(1), "corn");
    assert_eq!(table.label(2), "tomato");
    Ok(())
}

#[test]
fn test_written_index_reloads_identically() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    for name in ["Tomato___healthy", "Apple___scab", "Corn___rust"] {
        fs::create_dir(dir.path().join(name))?;
    }
    let table = ClassIndexTable::from_directory(dir.path())?;
    let path = dir.path().join("out").join("class_indices.json");
    table.write_json(&path)?;

    let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
    assert_eq!(raw["Apple___scab"], 0);
    assert_eq!(raw["Tomato___healthy"], 2);
    assert_eq!(ClassIndexTable::from_file(&path)?, table);
    Ok(())
}

#[test]
fn test_missing_index_gets_placeholder_label() -> Result<(), Box<dyn std::error::Error>> {
    let table = ClassIndexTable::from_json_str(r#"{"healthy": 0, "blight": 2}"#)?;
    assert_eq!(table.label(2), "blight");
    assert_eq!(table.label(1), "1");
    assert_eq!(table.index_of("healthy"), Some(0));
    Ok(())
}

#[test]
fn test_rejects_negative_and_duplicate_indices() {
    let negative = ClassIndexTable::from_json_str(r#"{"a": -1}"#);
    assert!(matches!(negative, Err(ClassIndexError::InvalidIndexMapping(_))));

    let duplicate = ClassIndexTable::from_json_str(r#"{"a": 0, "b": 0}"#);
    assert!(matches!(duplicate, Err(ClassIndexError::InvalidIndexMapping(_))));
}

#[test]
fn test_missing_file_is_io_error() {
    let result = ClassIndexTable::from_file("/nonexistent/leafscope/class_indices.json");
    assert!(matches!(result, Err(ClassIndexError::IoError(_))));
}
